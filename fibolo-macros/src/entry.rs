use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

const KNOWN_OPTIONS: &str = "`stack_size`, `poll_interval_ms`";

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // Expand to something close to the input even on errors, so IDEs keep
    // working on the function body.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, false))
    };

    match config {
        Ok(config) => expand(input, false, config),
        Err(e) => token_stream_with_error(expand(input, false, FinalConfig::default()), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => expand(input, true, config),
        Err(e) => token_stream_with_error(expand(input, true, FinalConfig::default()), e),
    }
}

#[derive(Default)]
struct FinalConfig {
    stack_size: Option<usize>,
    poll_interval_ms: Option<u64>,
}

struct ConfigBuilder {
    stack_size: Option<usize>,
    poll_interval_ms: Option<u64>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            stack_size: None,
            poll_interval_ms: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "fibolo::test"
        } else {
            "fibolo::main"
        }
    }

    fn set_stack_size(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.stack_size.is_some() {
            return Err(syn::Error::new(span, "`stack_size` set multiple times."));
        }

        self.stack_size = Some(parse_int(lit, span, "stack_size")?);

        Ok(())
    }

    fn set_poll_interval_ms(&mut self, lit: syn::Lit, span: Span) -> Result<(), syn::Error> {
        if self.poll_interval_ms.is_some() {
            return Err(syn::Error::new(span, "`poll_interval_ms` set multiple times."));
        }

        let ms = parse_int(lit, span, "poll_interval_ms")?;
        if ms == 0 {
            return Err(syn::Error::new(span, "`poll_interval_ms` may not be 0."));
        }
        self.poll_interval_ms = Some(ms as u64);

        Ok(())
    }

    fn build(self) -> FinalConfig {
        FinalConfig {
            stack_size: self.stack_size,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

fn build_config(
    input: &ItemFn,
    args: AttributeArgs,
    is_test: bool,
) -> Result<FinalConfig, syn::Error> {
    let mut config = ConfigBuilder::new(is_test);
    let macro_name = config.macro_name();

    if let Some(asyncness) = input.sig.asyncness {
        let msg = format!(
            "`#[{macro_name}]` runs the function on a fiber, remove the `async` keyword"
        );
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "stack_size" => config.set_stack_size(lit.clone(), lit.span())?,
                    "poll_interval_ms" => config.set_poll_interval_ms(lit.clone(), lit.span())?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: {KNOWN_OPTIONS}"
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "stack_size" | "poll_interval_ms" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: {KNOWN_OPTIONS}."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

fn expand(input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    // Type mismatches are reported on the last statement, point there.
    let (last_stmt_start_span, last_stmt_end_span) = {
        let mut last_stmt = input.stmts.last().cloned().unwrap_or_default().into_iter();

        let start = last_stmt.next().map_or_else(Span::call_site, |t| t.span());
        let end = last_stmt.last().map_or(start, |t| t.span());
        (start, end)
    };

    let mut rt = quote_spanned! {last_stmt_start_span=>
        fibolo::runtime::Builder::new_local()
    };

    if let Some(v) = config.stack_size {
        rt = quote_spanned! {last_stmt_start_span=> #rt.stack_size(#v) };
    }
    if let Some(v) = config.poll_interval_ms {
        rt = quote_spanned! {last_stmt_start_span=>
            #rt.poll_interval(::std::time::Duration::from_millis(#v))
        };
    }

    let generated_attrs = if is_test {
        quote! {
            #[::core::prelude::v1::test]
        }
    } else {
        quote! {}
    };

    let output_type = match &input.sig.output {
        syn::ReturnType::Default => quote! { () },
        syn::ReturnType::Type(_, ret_type) => quote! { #ret_type },
    };

    // The body becomes the root fiber. `return` and `?` keep their meaning
    // since the closure has the function's return type.
    let body = input.body();
    let body = quote! {
        let body = move || -> #output_type #body;
    };

    let last_block = quote_spanned! {last_stmt_end_span=>
        #[allow(clippy::expect_used, clippy::needless_return)]
        {
            return #rt
                .try_build()
                .expect("Failed building the Runtime")
                .block_on(body);
        }
    };

    input.into_tokens(generated_attrs, body, last_block)
}
