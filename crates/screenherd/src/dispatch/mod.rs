//! Command-line parsing and verb dispatch for the panel prompt.
//!
//! Every verb validates its whole target set before touching any server.
//! Errors are returned to the caller, which renders them with
//! [`Error::report`](crate::Error::report); none of them end the session.

use screenherd_macros::VerbTable;
use tracing::{debug, info};

use crate::error::{Error, ErrorKind, Result};
use crate::session::Session;

mod verbs;

pub use verbs::{
    CopyVerb, ExitVerb, HelpVerb, RefreshVerb, ReturnVerb, ServerVerb, TaskVerb, ViewVerb,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Command done; the text is shown on the result line.
    Done(String),
    /// Leave the panel.
    Exit,
}

pub type VerbFn = fn(&Invocation<'_>, &mut Session) -> Result<Outcome>;

#[VerbTable(verbs = [
    TaskVerb,
    ViewVerb,
    ReturnVerb,
    ServerVerb,
    CopyVerb,
    RefreshVerb,
    HelpVerb,
    ExitVerb,
])]
pub struct Verbs;

/// One parsed command line: the verb and its whitespace-separated arguments.
/// Byte offsets are kept so free text (a command to launch) can be taken
/// verbatim from the original line.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    line: &'a str,
    verb: &'a str,
    args: Vec<&'a str>,
    offsets: Vec<usize>,
}

impl<'a> Invocation<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let mut words = split_words(line).into_iter();
        let (_, verb) = words.next()?;
        let (offsets, args) = words.unzip();
        Some(Self {
            line,
            verb,
            args,
            offsets,
        })
    }

    pub fn verb(&self) -> &'a str {
        self.verb
    }

    pub fn args(&self) -> &[&'a str] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&'a str> {
        self.args.get(index).copied()
    }

    /// Like [`arg`](Self::arg) but a missing argument is a usage error.
    pub fn required(&self, index: usize, what: &str) -> Result<&'a str> {
        self.arg(index)
            .ok_or_else(|| Error::usage(format!("missing {what}")))
    }

    /// Raw text of the line from argument `index` to the end, inner spacing kept.
    pub fn rest(&self, index: usize) -> &'a str {
        match self.offsets.get(index) {
            Some(&at) => self.line[at..].trim_end(),
            None => "",
        }
    }
}

fn split_words(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

/// Parses and runs one command line against the session.
pub fn dispatch(session: &mut Session, line: &str) -> Result<Outcome> {
    let Some(inv) = Invocation::parse(line) else {
        return Err(Error::usage("empty command (try 'help')"));
    };
    let Some(run) = Verbs::lookup(inv.verb()) else {
        return Err(Error::usage(format!(
            "unknown command '{}' (known: {})",
            inv.verb(),
            Verbs::NAMES.join(", ")
        )));
    };
    debug!(verb = inv.verb(), args = inv.args().len(), "dispatch");
    let outcome = run(&inv, session);
    match &outcome {
        Ok(Outcome::Done(msg)) => info!(command = line.trim(), result = %msg, "command done"),
        Ok(Outcome::Exit) => info!("exit requested"),
        Err(e) => info!(command = line.trim(), error = %e.report(), "command failed"),
    }
    outcome
}

/// Collects the per-target results of an apply phase that cannot be rolled back.
#[derive(Debug, Default)]
pub(crate) struct ApplyReport {
    applied: Vec<String>,
    failed: Vec<(String, Error)>,
}

impl ApplyReport {
    pub(crate) fn applied(&mut self, what: impl Into<String>) {
        self.applied.push(what.into());
    }

    pub(crate) fn failed(&mut self, what: impl Into<String>, err: Error) {
        self.failed.push((what.into(), err));
    }

    /// `summary` describes the successful part. With failures, a lone failure
    /// is returned unchanged; several keep their shared kind, or become
    /// `RemoteFailure` when the kinds differ.
    pub(crate) fn finish(mut self, summary: String) -> Result<Outcome> {
        if self.failed.is_empty() {
            return Ok(Outcome::Done(summary));
        }
        if self.applied.is_empty() && self.failed.len() == 1 {
            let (what, err) = self.failed.remove(0);
            return Err(Error::new(err.kind(), format!("{what}: {}", err.message())));
        }

        let first = self.failed[0].1.kind();
        let kind = if self.failed.iter().all(|(_, e)| e.kind() == first) {
            first
        } else {
            ErrorKind::RemoteFailure
        };
        let failures = self
            .failed
            .iter()
            .map(|(what, e)| format!("{what}: {}", e.message()))
            .collect::<Vec<_>>()
            .join("; ");
        let done = if self.applied.is_empty() {
            "nothing applied".to_string()
        } else {
            format!("applied {}", self.applied.join(", "))
        };
        let total = self.failed.len() + self.applied.len();
        Err(Error::new(
            kind,
            format!("{} of {total} failed ({failures}); {done}", self.failed.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_keeps_raw_rest() {
        let inv = Invocation::parse("  task all add  echo  'a  b'  ").expect("parse");
        assert_eq!(inv.verb(), "task");
        assert_eq!(inv.args(), &["all", "add", "echo", "'a", "b'"]);
        assert_eq!(inv.rest(2), "echo  'a  b'");
        assert_eq!(inv.rest(9), "");
        assert!(Invocation::parse(" \t ").is_none());
    }

    #[test]
    fn lookup_is_case_insensitive_with_aliases() {
        assert!(Verbs::lookup("TASK").is_some());
        assert!(Verbs::lookup("quit").is_some());
        assert!(Verbs::lookup("Exit").is_some());
        assert!(Verbs::lookup("launch").is_none());
        assert_eq!(Verbs::USAGES.len(), Verbs::NAMES.len());
    }

    #[test]
    fn report_with_single_failure_keeps_kind() {
        let mut r = ApplyReport::default();
        r.failed("server 0", Error::new(ErrorKind::AmbiguousLaunch, "no new session"));
        let err = r.finish("x".into()).expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::AmbiguousLaunch);
        assert_eq!(err.message(), "server 0: no new session");
    }

    #[test]
    fn report_with_mixed_failures_is_remote_failure() {
        let mut r = ApplyReport::default();
        r.applied("server 0");
        r.failed("server 1", Error::new(ErrorKind::RemoteTimeout, "slow"));
        r.failed("server 2", Error::new(ErrorKind::SessionNotFound, "gone"));
        let err = r.finish("x".into()).expect_err("failed");
        assert_eq!(err.kind(), ErrorKind::RemoteFailure);
        assert!(err.message().contains("2 of 3 failed"), "{}", err.message());
        assert!(err.message().contains("applied server 0"), "{}", err.message());
    }
}
