use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{
    parse_macro_input, parse_quote, Expr, FnArg, GenericArgument, Ident, ItemFn, MetaNameValue,
    Pat, PathArguments, ReturnType, Token, Type,
};

/// Parsed macro attributes
#[derive(Default)]
struct FlyweightAttributes {
    custom_name: Option<String>,
}

/// Parse the `name` attribute
fn parse_name_attribute(nv: &MetaNameValue) -> syn::Result<String> {
    match &nv.value {
        Expr::Lit(expr_lit) => match &expr_lit.lit {
            syn::Lit::Str(s) => Ok(s.value()),
            _ => Err(syn::Error::new_spanned(
                &nv.value,
                "invalid literal for `name`: expected string",
            )),
        },
        _ => Err(syn::Error::new_spanned(
            nv,
            "invalid syntax for `name`: expected `name = \"...\"`",
        )),
    }
}

/// Parse macro attributes from the attribute token stream
fn parse_attributes(attr: TokenStream2) -> syn::Result<FlyweightAttributes> {
    use syn::parse::Parser;

    let parser = Punctuated::<MetaNameValue, Token![,]>::parse_terminated;
    let parsed_args = parser.parse2(attr)?;

    let mut attrs = FlyweightAttributes::default();
    for nv in parsed_args {
        if nv.path.is_ident("name") {
            attrs.custom_name = Some(parse_name_attribute(&nv)?);
        } else {
            return Err(syn::Error::new_spanned(
                &nv.path,
                "unknown attribute: expected `name`",
            ));
        }
    }
    Ok(attrs)
}

/// Splits the declared return type into the flyweight's value type and the
/// rewritten return type, which wraps that value type in an `Arc`.
///
/// `Result<T, E>` (under any path ending in `Result`) becomes `Result<Arc<T>, E>`;
/// any other `T` becomes `Arc<T>`. The flag tells which of the two it was.
fn split_return_type(ty: &Type) -> (Type, Type, bool) {
    if let Type::Path(type_path) = ty {
        if let Some(last) = type_path.path.segments.last() {
            if last.ident == "Result" {
                if let PathArguments::AngleBracketed(args) = &last.arguments {
                    if let Some(GenericArgument::Type(value_ty)) = args.args.first() {
                        let value_ty = value_ty.clone();
                        let mut rewritten = type_path.clone();
                        if let Some(PathArguments::AngleBracketed(args)) = rewritten
                            .path
                            .segments
                            .last_mut()
                            .map(|segment| &mut segment.arguments)
                        {
                            if let Some(first) = args.args.first_mut() {
                                *first = GenericArgument::Type(
                                    parse_quote!(::std::sync::Arc<#value_ty>),
                                );
                            }
                        }
                        return (value_ty, Type::Path(rewritten), true);
                    }
                }
            }
        }
    }
    (ty.clone(), parse_quote!(::std::sync::Arc<#ty>), false)
}

/// Collect the argument names and types that make up the key
fn key_arguments(input: &ItemFn) -> syn::Result<(Vec<Ident>, Vec<Type>)> {
    let mut idents = Vec::new();
    let mut types = Vec::new();
    for arg in input.sig.inputs.iter() {
        match arg {
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "#[flyweight] constructors cannot take `self`",
                ));
            }
            FnArg::Typed(pat_type) => match &*pat_type.pat {
                Pat::Ident(pat_ident) => {
                    idents.push(pat_ident.ident.clone());
                    types.push((*pat_type.ty).clone());
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "#[flyweight] constructor arguments must be plain identifiers",
                    ));
                }
            },
        }
    }
    Ok((idents, types))
}

fn expand(attrs: FlyweightAttributes, input: ItemFn) -> syn::Result<TokenStream2> {
    let sig = &input.sig;
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "#[flyweight] constructors cannot be generic",
        ));
    }
    if let Some(asyncness) = &sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "#[flyweight] constructors cannot be async",
        ));
    }

    let declared_ty = match &sig.output {
        ReturnType::Type(_, ty) => (**ty).clone(),
        ReturnType::Default => {
            return Err(syn::Error::new_spanned(
                sig,
                "#[flyweight] constructors must return the flyweight type",
            ));
        }
    };
    let (value_ty, rewritten_ty, is_result) = split_return_type(&declared_ty);
    let (arg_idents, arg_types) = key_arguments(&input)?;

    let fn_name_str = sig.ident.to_string();
    let name_expr = match attrs.custom_name {
        Some(name) => quote! { #name },
        None => quote! {
            &::std::format!("{}::{}", ::std::any::type_name::<#value_ty>(), #fn_name_str)
        },
    };

    let build_call = if is_result {
        quote! { __FLYWEIGHT_STORE.get_or_try_build(__flyweight_key, __flyweight_build) }
    } else {
        quote! { __FLYWEIGHT_STORE.get_or_build(__flyweight_key, __flyweight_build) }
    };

    let mut rewritten_sig = sig.clone();
    rewritten_sig.output = parse_quote!(-> #rewritten_ty);

    let fn_attrs = &input.attrs;
    let vis = &input.vis;
    let block = &input.block;

    Ok(quote! {
        #(#fn_attrs)*
        #vis #rewritten_sig {
            static __FLYWEIGHT_STORE: ::flyweight::__private::Lazy<
                ::flyweight::InstanceStore<(#(#arg_types,)*)>,
            > = ::flyweight::__private::Lazy::new(::flyweight::InstanceStore::new);

            {
                static __FLYWEIGHT_STATS_ONCE: ::std::sync::Once = ::std::sync::Once::new();
                __FLYWEIGHT_STATS_ONCE.call_once(|| {
                    ::flyweight::__private::register_stats::<#value_ty, _>(
                        #name_expr,
                        &*__FLYWEIGHT_STORE,
                    );
                });
            }

            let __flyweight_key = (#(::std::clone::Clone::clone(&#arg_idents),)*);
            let __flyweight_build = move || -> #declared_ty #block;
            #build_call
        }
    })
}

/// Turns a constructor into a flyweight constructor: equal arguments give the
/// same shared instance for as long as anyone holds it.
///
/// The macro rewrites the constructor's return type from `T` to `Arc<T>` (or from
/// `Result<T, E>` to `Result<Arc<T>, E>`), and routes the body through a store
/// private to the constructor. The key is the tuple of the constructor's
/// arguments. The body only runs when no live instance exists for the key; its
/// value is then shared with every later call with equal arguments until the last
/// `Arc` to it is dropped.
///
/// Concurrent calls with equal arguments run the body once: the other callers
/// wait and receive the instance built by the first. If the body returns `Err`
/// or panics, nothing is recorded and the next call runs the body again.
///
/// # Requirements
///
/// - **Arguments**: Plain identifiers of owned types implementing
///   `Clone + Hash + Eq + Send + Sync + 'static` (they form the key)
/// - **Return type**: The flyweight type (usually `Self`) or a `Result` of it; the
///   flyweight type must be `Send + Sync + 'static`
/// - **Not supported**: `self` receivers, generic or `async` constructors,
///   constructors in generic `impl` blocks
/// - **No self-recursion**: The body may call other flyweight constructors, but
///   not the constructor it belongs to. The nested call defers to the outer one,
///   registers its instance there, and the outer build then panics with a
///   duplicate registration. Normalize the arguments before the call instead.
///
/// # Macro Parameters
///
/// - `name` (optional): Name under which the store's statistics are published in
///   `flyweight::stats_registry`, next to the flyweight type. Default:
///   `<type name>::<function name>`.
///
/// # Examples
///
/// ```ignore
/// use flyweight::flyweight;
///
/// #[derive(Debug)]
/// pub struct Fraction {
///     num: i64,
///     den: i64,
/// }
///
/// impl Fraction {
///     #[flyweight]
///     pub fn new(num: i64, den: i64) -> Result<Self, String> {
///         if den == 0 {
///             return Err("division by zero".to_string());
///         }
///         Ok(Fraction { num, den })
///     }
/// }
///
/// let a = Fraction::new(1, 2).unwrap();
/// let b = Fraction::new(1, 2).unwrap();
/// assert!(std::sync::Arc::ptr_eq(&a, &b));
/// ```
///
/// ## Custom Name for Statistics
///
/// ```ignore
/// impl Color {
///     #[flyweight(name = "palette")]
///     pub fn rgb(r: u8, g: u8, b: u8) -> Self {
///         Color { r, g, b }
///     }
/// }
///
/// let stats = flyweight::stats_registry::get("palette").unwrap();
/// println!("{} colors built", stats.builds());
/// ```
#[proc_macro_attribute]
pub fn flyweight(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let expanded = parse_attributes(attr.into()).and_then(|attrs| expand(attrs, input));
    match expanded {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}
