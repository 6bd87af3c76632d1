use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Registers a panel verb on a unit struct.
///
/// Keys: `name`, `usage`, `min_args`, optional `max_args` and `aliases`.
/// The struct supplies
/// `fn run(inv: &Invocation<'_>, session: &mut Session) -> Result<Outcome>`;
/// the generated `invoke` checks arity first and answers with the usage line.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Verb(attr: TokenStream, item: TokenStream) -> TokenStream {
    match verb_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Builds the name lookup over a list of `#[Verb]` structs.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn VerbTable(attr: TokenStream, item: TokenStream) -> TokenStream {
    match table_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_usize(expr: &Expr) -> syn::Result<usize> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Int(i), ..
        }) => i.base10_parse::<usize>(),
        _ => Err(syn::Error::new(expr.span(), "expected integer literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        out.push(lit_str(e)?);
    }
    Ok(out)
}

fn expr_array_paths(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        match e {
            Expr::Path(ExprPath { path, .. }) => out.push(path.clone()),
            _ => return Err(syn::Error::new(e.span(), "expected path (identifier)")),
        }
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Some(ident) = a.path().get_ident() else {
                return true;
            };
            ident != "Verb" && ident != "VerbTable"
        })
        .cloned()
        .collect()
}

struct VerbMeta {
    name: String,
    usage: String,
    aliases: Vec<String>,
    min_args: usize,
    max_args: Option<usize>,
}

fn parse_verb_meta(attr: TokenStream, ident: &syn::Ident) -> syn::Result<VerbMeta> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut name: Option<String> = None;
    let mut usage: Option<String> = None;
    let mut aliases: Vec<String> = Vec::new();
    let mut min_args: usize = 0;
    let mut max_args: Option<usize> = None;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "name" => name = Some(lit_str(v)?),
            "usage" => usage = Some(lit_str(v)?),
            "aliases" => aliases = expr_array_strings(v)?,
            "min_args" => min_args = lit_usize(v)?,
            "max_args" => max_args = Some(lit_usize(v)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Verb attribute key '{other}'"),
                ));
            }
        }
    }

    let name = name.ok_or_else(|| syn::Error::new(ident.span(), "Verb: missing name"))?;
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(syn::Error::new(
            ident.span(),
            "Verb: name must be a single word",
        ));
    }
    if let Some(max) = max_args
        && max < min_args
    {
        return Err(syn::Error::new(
            ident.span(),
            "Verb: max_args is smaller than min_args",
        ));
    }

    Ok(VerbMeta {
        usage: usage.unwrap_or_else(|| name.clone()),
        name,
        aliases,
        min_args,
        max_args,
    })
}

fn verb_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let meta = parse_verb_meta(attr, &struct_ident)?;
    let name_lit = meta.name;
    let usage_lit = meta.usage;
    let alias_lits = meta.aliases;
    let min_args = meta.min_args;

    let max_args_expr = match meta.max_args {
        Some(max) => quote! { ::core::option::Option::Some(#max) },
        None => quote! { ::core::option::Option::None },
    };
    let out_of_range = match (min_args, meta.max_args) {
        (0, Some(max)) => Some(quote! { n > #max }),
        (0, None) => None,
        (min, Some(max)) => Some(quote! { n < #min || n > #max }),
        (min, None) => Some(quote! { n < #min }),
    };
    let arity_check = out_of_range.map(|cond| {
        quote! {
            let n = inv.args().len();
            if #cond {
                return Err(crate::Error::usage(format!("usage: {}", Self::USAGE)));
            }
        }
    });

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const NAME: &'static str = #name_lit;
            pub const USAGE: &'static str = #usage_lit;
            pub const ALIASES: &'static [&'static str] = &[#(#alias_lits),*];
            pub const MIN_ARGS: usize = #min_args;
            pub const MAX_ARGS: ::core::option::Option<usize> = #max_args_expr;

            pub fn matches(word: &str) -> bool {
                word.eq_ignore_ascii_case(Self::NAME)
                    || Self::ALIASES.iter().any(|a| word.eq_ignore_ascii_case(a))
            }

            pub fn invoke(
                inv: &crate::dispatch::Invocation<'_>,
                session: &mut crate::session::Session,
            ) -> crate::Result<crate::dispatch::Outcome> {
                #arity_check
                Self::run(inv, session)
            }
        }
    };

    Ok(expanded.into())
}

fn table_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut verbs: Option<Vec<syn::Path>> = None;
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        match key.as_str() {
            "verbs" => verbs = Some(expr_array_paths(&nv.value)?),
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown VerbTable attribute key '{other}'"),
                ));
            }
        }
    }
    let verbs =
        verbs.ok_or_else(|| syn::Error::new(struct_ident.span(), "VerbTable: missing verbs"))?;

    let lookups = verbs.iter().map(|p| {
        quote! {
            if #p::matches(word) {
                return ::core::option::Option::Some(#p::invoke);
            }
        }
    });
    let usages = verbs.iter().map(|p| quote! { #p::USAGE });
    let names = verbs.iter().map(|p| quote! { #p::NAME });

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const NAMES: &'static [&'static str] = &[#(#names),*];
            pub const USAGES: &'static [&'static str] = &[#(#usages),*];

            pub fn lookup(word: &str) -> ::core::option::Option<crate::dispatch::VerbFn> {
                #(#lookups)*
                ::core::option::Option::None
            }
        }
    };

    Ok(expanded.into())
}
