use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, Type,
    parse_macro_input, spanned::Spanned,
};

/// Derives `meridian::ipc::shmem::SharedMemorySafe`.
///
/// Checked at compile time:
///
/// 1. The item carries a stable layout: `#[repr(C)]`, `#[repr(transparent)]`,
///    or a primitive repr for enums. Extra modifiers such as `align(64)` are
///    allowed alongside.
/// 2. No field type mentions a heap handle (`Vec`, `Box`, `String`, ...), a
///    reference-counted pointer, a process-local lock, a reference or a raw
///    pointer, at any nesting depth.
/// 3. Every field type implements `SharedMemorySafe` (emitted as where
///    clauses, so the error points at the offending field).
///
/// The generated impl is `unsafe`: concurrent access to the type must still
/// go through atomics or a protocol that hands out exclusive slots.
///
/// ```
/// # use meridian::SharedMemorySafe;
/// use std::sync::atomic::{AtomicI32, AtomicI64};
///
/// #[derive(SharedMemorySafe)]
/// #[repr(C, align(64))]
/// struct Record {
///     state: AtomicI32,
///     registration_id: AtomicI64,
///     key: [u8; 112],
/// }
/// ```
///
/// ```compile_fail
/// # use meridian::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// struct MissingRepr {
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use meridian::SharedMemorySafe;
/// #[derive(SharedMemorySafe)]
/// #[repr(C)]
/// struct Label {
///     text: String,
/// }
/// ```
#[proc_macro_derive(SharedMemorySafe)]
pub fn derive_shared_memory_safe(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(Error::into_compile_error)
        .into()
}

fn crate_path() -> proc_macro2::TokenStream {
    match crate_name("meridian") {
        Ok(FoundCrate::Name(name)) => {
            let ident = Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        // Inside meridian itself the crate re-exports itself as `meridian`.
        Ok(FoundCrate::Itself) | Err(_) => quote!(::meridian),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    require_stable_repr(input)?;

    let field_types = field_types(&input.data)?;
    for ty in &field_types {
        reject_pointer_types(ty, ty)?;
    }

    let name = &input.ident;
    let krate = crate_path();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let mut predicates: Vec<syn::WherePredicate> = where_clause
        .map(|w| w.predicates.iter().cloned().collect())
        .unwrap_or_default();
    predicates.extend(field_types.iter().map(|ty| -> syn::WherePredicate {
        syn::parse_quote!(#ty: #krate::ipc::shmem::SharedMemorySafe)
    }));

    Ok(quote! {
        unsafe impl #impl_generics #krate::ipc::shmem::SharedMemorySafe for #name #ty_generics
        where
            #(#predicates),*
        {}
    })
}

const LAYOUT_REPRS: &[&str] = &[
    "C",
    "transparent",
    "u8",
    "u16",
    "u32",
    "u64",
    "u128",
    "usize",
    "i8",
    "i16",
    "i32",
    "i64",
    "i128",
    "isize",
];

fn repr_fixes_layout(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut fixed = false;
    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && LAYOUT_REPRS.iter().any(|r| ident == r)
        {
            fixed = true;
        }
        // Consume `align(N)` / `packed(N)` arguments so parsing continues.
        if meta.input.peek(syn::token::Paren) {
            let content;
            syn::parenthesized!(content in meta.input);
            content.parse::<proc_macro2::TokenStream>()?;
        }
        Ok(())
    })?;
    Ok(fixed)
}

fn require_stable_repr(input: &DeriveInput) -> syn::Result<()> {
    for attr in &input.attrs {
        if repr_fixes_layout(attr)? {
            return Ok(());
        }
    }

    let msg = if matches!(input.data, Data::Enum(_)) {
        "SharedMemorySafe requires #[repr(C)] or a primitive repr such as #[repr(u8)] on enums"
    } else {
        "SharedMemorySafe requires #[repr(C)] or #[repr(transparent)]"
    };
    Err(Error::new(input.ident.span(), msg))
}

fn field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn of(fields: &Fields) -> impl Iterator<Item = Type> + '_ {
        fields.iter().map(|f| f.ty.clone())
    }

    match data {
        Data::Struct(s) => Ok(of(&s.fields).collect()),
        Data::Enum(e) => Ok(e.variants.iter().flat_map(|v| of(&v.fields)).collect()),
        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "SharedMemorySafe cannot be derived for unions",
        )),
    }
}

fn forbidden_reason(ident: &Ident) -> Option<&'static str> {
    const HEAP: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString", "HashMap"];
    const SHARED: &[&str] = &["Rc", "Arc", "Weak"];
    const LOCAL_SYNC: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier", "Cell", "RefCell"];

    if HEAP.iter().any(|name| ident == name) {
        Some("owns a heap allocation; use inline data like `[u8; N]`")
    } else if SHARED.iter().any(|name| ident == name) {
        Some("is a reference-counted pointer; virtual addresses differ between processes")
    } else if LOCAL_SYNC.iter().any(|name| ident == name) {
        Some("is process-local; use atomics for cross-process state")
    } else {
        None
    }
}

fn reject_pointer_types(ty: &Type, field_ty: &Type) -> syn::Result<()> {
    let fail = |span: proc_macro2::Span, what: &str| {
        Err(Error::new(
            span,
            format!("field type `{}` {what}", quote!(#field_ty)),
        ))
    };

    match ty {
        Type::Path(type_path) => {
            for segment in &type_path.path.segments {
                if let Some(reason) = forbidden_reason(&segment.ident) {
                    return fail(
                        segment.ident.span(),
                        &format!("contains `{}` which {reason}", segment.ident),
                    );
                }
                if let PathArguments::AngleBracketed(args) = &segment.arguments {
                    for arg in &args.args {
                        if let GenericArgument::Type(inner) = arg {
                            reject_pointer_types(inner, field_ty)?;
                        }
                    }
                }
            }
            Ok(())
        }
        Type::Reference(r) => fail(r.span(), "contains a reference, which is process-specific"),
        Type::Ptr(p) => fail(p.span(), "contains a raw pointer, which is process-specific"),
        Type::Tuple(t) => t
            .elems
            .iter()
            .try_for_each(|elem| reject_pointer_types(elem, field_ty)),
        Type::Array(a) => reject_pointer_types(&a.elem, field_ty),
        Type::Slice(s) => reject_pointer_types(&s.elem, field_ty),
        Type::Group(g) => reject_pointer_types(&g.elem, field_ty),
        Type::Paren(p) => reject_pointer_types(&p.elem, field_ty),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    fn rejects(ty: Type) -> bool {
        reject_pointer_types(&ty, &ty).is_err()
    }

    #[test]
    fn test_repr_c_with_align_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C, align(64))]
            struct Record { value: u64 }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn test_split_repr_attributes_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            #[repr(C)]
            struct Record { value: u64 }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn test_align_alone_rejected() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            struct Record { value: u64 }
        };
        assert!(require_stable_repr(&input).is_err());
    }

    #[test]
    fn test_primitive_enum_repr_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(i32)]
            enum State { Unused = 0, Allocated = 1, Reclaimed = -1 }
        };
        assert!(require_stable_repr(&input).is_ok());
    }

    #[test]
    fn test_missing_repr_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Record { value: u64 }
        };
        assert!(require_stable_repr(&input).is_err());
    }

    #[test]
    fn test_inline_types_accepted() {
        assert!(!rejects(parse_quote!(AtomicI64)));
        assert!(!rejects(parse_quote!([AtomicU64; 14])));
        assert!(!rejects(parse_quote!((u32, i64))));
        assert!(!rejects(parse_quote!(UnsafeCell<MaybeUninit<T>>)));
    }

    #[test]
    fn test_pointer_types_rejected_at_any_depth() {
        assert!(rejects(parse_quote!(String)));
        assert!(rejects(parse_quote!(Vec<u8>)));
        assert!(rejects(parse_quote!(Option<Box<u8>>)));
        assert!(rejects(parse_quote!([Arc<u64>; 4])));
        assert!(rejects(parse_quote!((u32, Mutex<u64>))));
        assert!(rejects(parse_quote!(&'static str)));
        assert!(rejects(parse_quote!(*mut u8)));
    }

    #[test]
    fn test_enum_variant_fields_collected() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            enum Command {
                Keepalive(ClientId),
                Remove { client: ClientId, counter: CounterId },
                Noop,
            }
        };
        assert_eq!(field_types(&input.data).unwrap().len(), 3);
    }

    #[test]
    fn test_union_rejected() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            union Raw { a: u32, b: f32 }
        };
        assert!(field_types(&input.data).is_err());
    }
}
