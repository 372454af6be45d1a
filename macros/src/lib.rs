use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::punctuated::Punctuated;
use syn::{Expr, ExprLit, ItemFn, Lit, Meta, Token, parse_macro_input};

/// Marks a function as a replacement for a C symbol.
///
/// This attribute macro:
/// 1. Renames `fn foo` to `extern "C" fn lodge_foo`
/// 2. Declares `ORIG_FOO`, the slot that receives the real `foo` at install time
/// 3. Registers `foo` -> `lodge_foo` in the slice named by the first argument
///
/// The first argument picks the registry: `guest` for the process-creation
/// hooks, `loader` for the loader validation bypass. An optional
/// `symbol = "name"` overrides the looked-up symbol name.
///
/// # Example
///
/// ```ignore
/// #[interpose(guest)]
/// pub fn waitpid(pid: libc::pid_t, status: *mut libc::c_int, options: libc::c_int) -> libc::pid_t {
///     // implementation
/// }
/// ```
///
/// Expands to:
///
/// ```ignore
/// #[unsafe(no_mangle)]
/// pub extern "C" fn lodge_waitpid(pid: libc::pid_t, status: *mut libc::c_int, options: libc::c_int) -> libc::pid_t {
///     // implementation
/// }
///
/// pub static ORIG_WAITPID: crate::symbols::Original = crate::symbols::Original::new();
///
/// #[linkme::distributed_slice(crate::symbols::GUEST_HOOKS)]
/// static _LODGE_HOOK_WAITPID: crate::symbols::Interposer = crate::symbols::Interposer {
///     symbol: "waitpid",
///     replacement: crate::symbols::FnPtr(lodge_waitpid as *const ()),
///     original: &ORIG_WAITPID,
/// };
/// ```
#[proc_macro_attribute]
pub fn interpose(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Meta, Token![,]>::parse_terminated);
    let input = parse_macro_input!(item as ItemFn);

    let mut registry = None;
    let mut symbol_override = None;
    for arg in &args {
        match arg {
            Meta::Path(path) if path.is_ident("guest") => registry = Some("GUEST_HOOKS"),
            Meta::Path(path) if path.is_ident("loader") => registry = Some("LOADER_HOOKS"),
            Meta::NameValue(nv) if nv.path.is_ident("symbol") => match &nv.value {
                Expr::Lit(ExprLit {
                    lit: Lit::Str(s), ..
                }) => symbol_override = Some(s.value()),
                other => {
                    return syn::Error::new_spanned(other, "expected a string literal")
                        .to_compile_error()
                        .into();
                }
            },
            other => {
                return syn::Error::new_spanned(other, "expected `guest`, `loader` or `symbol = \"..\"`")
                    .to_compile_error()
                    .into();
            }
        }
    }
    let Some(registry) = registry else {
        return syn::Error::new(Span::call_site(), "missing registry: `guest` or `loader`")
            .to_compile_error()
            .into();
    };

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let attrs = &input.attrs;

    let original_name = &sig.ident;
    let lodge_name = format_ident!("lodge_{}", original_name);
    let upper = original_name.to_string().to_uppercase();
    let orig_static = format_ident!("ORIG_{}", upper);
    let hook_static = format_ident!("_LODGE_HOOK_{}", upper);
    let registry = format_ident!("{}", registry);
    let symbol_name = symbol_override.unwrap_or_else(|| original_name.to_string());

    let inputs = &sig.inputs;
    let output = &sig.output;

    let expanded = quote! {
        #(#attrs)*
        #[unsafe(no_mangle)]
        #vis extern "C" fn #lodge_name(#inputs) #output #block

        #vis static #orig_static: crate::symbols::Original = crate::symbols::Original::new();

        #[linkme::distributed_slice(crate::symbols::#registry)]
        static #hook_static: crate::symbols::Interposer = crate::symbols::Interposer {
            symbol: #symbol_name,
            replacement: crate::symbols::FnPtr(#lodge_name as *const ()),
            original: &#orig_static,
        };
    };

    TokenStream::from(expanded)
}
