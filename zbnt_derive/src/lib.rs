use proc_macro::TokenStream;
use quote::{
    format_ident,
    quote,
};
use syn::{
    parse_macro_input,
    Data,
    DataStruct,
    DeriveInput,
    Fields,
};

#[proc_macro_derive(RegisterBlock)]
/// Derived on a `#[repr(C)]` register layout to generate offset constants and volatile accessors
/// on `crate::mmio::Registers<T>`. Fields whose name starts with `_` are padding and get neither.
pub fn derive_register_block(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let block_name = input.ident;

    let mut repr_c = false;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("repr")) {
        let res = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("C") {
                repr_c = true;
            }
            Ok(())
        });
        if let Err(e) = res {
            return e.to_compile_error().into();
        }
    }
    if !repr_c {
        return syn::Error::new_spanned(&block_name, "Register blocks must be #[repr(C)]")
            .to_compile_error()
            .into();
    }

    let Data::Struct(DataStruct {
        fields: Fields::Named(fields),
        ..
    }) = input.data
    else {
        return syn::Error::new_spanned(&block_name, "Register blocks must have named fields")
            .to_compile_error()
            .into();
    };

    let mut consts = vec![];
    let mut getters = vec![];
    let mut setters = vec![];
    let mut names = vec![];
    let mut tys = vec![];
    for field in fields.named {
        let Some(ident) = field.ident else { continue };
        if ident.to_string().starts_with('_') {
            continue;
        }
        consts.push(format_ident!("{}", ident.to_string().to_uppercase()));
        setters.push(format_ident!("set_{}", ident));
        names.push(ident.clone());
        getters.push(ident);
        tys.push(field.ty);
    }

    let generated = quote! {
        impl #block_name {
            #(
                #[allow(dead_code)]
                pub const #consts: usize = ::core::mem::offset_of!(#block_name, #names);
            )*
        }

        impl crate::mmio::Registers<#block_name> {
            #(
                #[allow(dead_code)]
                #[must_use]
                pub fn #getters(&self) -> #tys {
                    self.read::<#tys>(#block_name::#consts)
                }

                #[allow(dead_code)]
                pub fn #setters(&self, value: #tys) {
                    self.write::<#tys>(#block_name::#consts, value)
                }
            )*
        }
    };
    TokenStream::from(generated)
}
