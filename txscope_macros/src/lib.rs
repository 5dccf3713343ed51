//! Procedural macros for the `txscope` transaction library.
//!
//! `#[transactional]` turns a synchronous function returning `Result<T, E>` into a
//! unit of work demarcated by the process-wide transaction manager
//! (`txscope::config`). The body runs inside the transaction; it commits when the
//! body returns `Ok`, and rolls back when it returns `Err` or panics.
//!
//! ```ignore
//! #[transactional(requires_new, isolation = "serializable", timeout_ms = 500)]
//! fn transfer(from: i64, to: i64) -> Result<(), AppError> {
//!     let tx = txscope::config::transaction()?;
//!     // ...
//!     Ok(())
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, spanned::Spanned, Expr, ItemFn, Lit, Meta, ReturnType,
    Token,
};

// --- Argument parsing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PropagationArg {
    Required,
    RequiresNew,
    Mandatory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IsolationArg {
    Default,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Parsed `#[transactional(...)]` options.
#[derive(Debug)]
struct TransactionalArgs {
    propagation: PropagationArg,
    isolation: IsolationArg,
    read_only: bool,
    timeout_ms: Option<u64>,
}

impl Default for TransactionalArgs {
    fn default() -> Self {
        Self {
            propagation: PropagationArg::Required,
            isolation: IsolationArg::Default,
            read_only: false,
            timeout_ms: None,
        }
    }
}

fn set_propagation(
    args: &mut TransactionalArgs,
    value: PropagationArg,
    meta: &Meta,
) -> syn::Result<()> {
    if args.propagation != PropagationArg::Required {
        return Err(syn::Error::new(
            meta.span(),
            "`requires_new` and `mandatory` are mutually exclusive",
        ));
    }
    args.propagation = value;
    Ok(())
}

fn parse_args(attr: TokenStream2) -> syn::Result<TransactionalArgs> {
    let mut args = TransactionalArgs::default();
    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(attr)?;
    for meta in &metas {
        let name = meta
            .path()
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path().span(), "Expected an identifier"))?
            .to_string();
        match (name.as_str(), meta) {
            ("requires_new", Meta::Path(_)) => {
                set_propagation(&mut args, PropagationArg::RequiresNew, meta)?
            }
            ("mandatory", Meta::Path(_)) => {
                set_propagation(&mut args, PropagationArg::Mandatory, meta)?
            }
            ("read_only", Meta::Path(_)) => args.read_only = true,
            ("isolation", Meta::NameValue(nv)) => {
                let value = match &nv.value {
                    Expr::Lit(expr) => match &expr.lit {
                        Lit::Str(s) => s.value(),
                        other => {
                            return Err(syn::Error::new(
                                other.span(),
                                "Expected a string for `isolation`",
                            ))
                        }
                    },
                    other => {
                        return Err(syn::Error::new(
                            other.span(),
                            "Expected a string for `isolation`",
                        ))
                    }
                };
                args.isolation = match value.as_str() {
                    "default" => IsolationArg::Default,
                    "read_committed" => IsolationArg::ReadCommitted,
                    "repeatable_read" => IsolationArg::RepeatableRead,
                    "serializable" => IsolationArg::Serializable,
                    other => {
                        return Err(syn::Error::new(
                            nv.value.span(),
                            format!(
                                "Unsupported isolation: `{}`. Use read_committed, repeatable_read or serializable",
                                other
                            ),
                        ))
                    }
                };
            }
            ("timeout_ms", Meta::NameValue(nv)) => {
                let millis = match &nv.value {
                    Expr::Lit(expr) => match &expr.lit {
                        Lit::Int(int) => int.base10_parse::<u64>()?,
                        other => {
                            return Err(syn::Error::new(
                                other.span(),
                                "Expected an integer for `timeout_ms`",
                            ))
                        }
                    },
                    other => {
                        return Err(syn::Error::new(
                            other.span(),
                            "Expected an integer for `timeout_ms`",
                        ))
                    }
                };
                args.timeout_ms = Some(millis);
            }
            ("requires_new" | "mandatory" | "read_only" | "isolation" | "timeout_ms", _) => {
                return Err(syn::Error::new(meta.span(), "Unsupported attribute format"))
            }
            _ => return Err(syn::Error::new(meta.path().span(), "Unknown attribute")),
        }
    }
    Ok(args)
}

// --- Code generation ---

fn definition_tokens(args: &TransactionalArgs) -> TokenStream2 {
    let propagation = match args.propagation {
        PropagationArg::Required => quote! { Required },
        PropagationArg::RequiresNew => quote! { RequiresNew },
        PropagationArg::Mandatory => quote! { Mandatory },
    };
    let isolation = match args.isolation {
        IsolationArg::Default => quote! { Default },
        IsolationArg::ReadCommitted => quote! { ReadCommitted },
        IsolationArg::RepeatableRead => quote! { RepeatableRead },
        IsolationArg::Serializable => quote! { Serializable },
    };
    let read_only = args.read_only;
    let timeout = match args.timeout_ms {
        Some(ms) => quote! {
            ::core::option::Option::Some(::core::time::Duration::from_millis(#ms))
        },
        None => quote! { ::core::option::Option::None },
    };
    quote! {
        ::txscope::transactions::TransactionDefinition {
            propagation: ::txscope::transactions::Propagation::#propagation,
            isolation: ::txscope::transactions::Isolation::#isolation,
            read_only: #read_only,
            timeout: #timeout,
        }
    }
}

fn expand(attr: TokenStream2, item: TokenStream2) -> syn::Result<TokenStream2> {
    let args = parse_args(attr)?;
    let func: ItemFn = syn::parse2(item)?;

    if let Some(asyncness) = &func.sig.asyncness {
        return Err(syn::Error::new(
            asyncness.span(),
            "#[transactional] does not support async fn; transactions are bound to the calling thread",
        ));
    }
    let ret = match &func.sig.output {
        ReturnType::Type(_, ty) => ty,
        ReturnType::Default => {
            return Err(syn::Error::new(
                func.sig.span(),
                "#[transactional] functions must return `Result<T, E>` with `E: From<TxError>`",
            ))
        }
    };

    let attrs = &func.attrs;
    let vis = &func.vis;
    let sig = &func.sig;
    let body = &func.block;
    let definition = definition_tokens(&args);

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            ::txscope::config::execute(
                &#definition,
                move |_tx: &::txscope::StatefulTransaction| -> #ret #body,
            )
        }
    })
}

/// Run the annotated function inside a transaction of the process-wide manager.
///
/// Options: `requires_new` or `mandatory` (default joins or demarcates, like
/// `Propagation::Required`), `read_only`,
/// `isolation = "read_committed" | "repeatable_read" | "serializable"` and
/// `timeout_ms = N`.
#[proc_macro_attribute]
pub fn transactional(attr: TokenStream, item: TokenStream) -> TokenStream {
    match expand(attr.into(), item.into()) {
        Ok(ts) => ts.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_arguments() {
        let args = parse_args(TokenStream2::new()).unwrap();
        assert_eq!(args.propagation, PropagationArg::Required);
        assert_eq!(args.isolation, IsolationArg::Default);
        assert!(!args.read_only);
        assert_eq!(args.timeout_ms, None);
    }

    #[test]
    fn parses_every_option() {
        let args = parse_args(quote! {
            requires_new, read_only, isolation = "serializable", timeout_ms = 250
        })
        .unwrap();
        assert_eq!(args.propagation, PropagationArg::RequiresNew);
        assert_eq!(args.isolation, IsolationArg::Serializable);
        assert!(args.read_only);
        assert_eq!(args.timeout_ms, Some(250));
    }

    #[test]
    fn rejects_bad_arguments() {
        let cases = [
            quote! { requires_new, mandatory },
            quote! { isolation = "snapshot" },
            quote! { isolation = 3 },
            quote! { timeout_ms = "soon" },
            quote! { read_only = true },
            quote! { retries = 3 },
        ];
        for case in cases {
            assert!(parse_args(case.clone()).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn rejects_async_and_unit_functions() {
        let err = expand(quote! {}, quote! { async fn f() -> Result<(), E> { Ok(()) } })
            .unwrap_err();
        assert!(err.to_string().contains("async fn"));

        let err = expand(quote! {}, quote! { fn f() {} }).unwrap_err();
        assert!(err.to_string().contains("must return"));
    }

    #[test]
    fn wraps_body_in_config_execute() {
        let out = expand(
            quote! { mandatory, timeout_ms = 5 },
            quote! { pub fn f(x: i64) -> Result<i64, E> { Ok(x) } },
        )
        .unwrap()
        .to_string();
        assert!(out.contains("pub fn f"));
        assert!(out.contains(":: txscope :: config :: execute"));
        assert!(out.contains("Propagation :: Mandatory"));
        assert!(out.contains("from_millis (5u64)"));
    }
}
