extern crate proc_macro;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_quote, Data, DeriveInput, Fields};

/// Derives `FixedSize`, `Encode` and `Decode` for a struct of fixed-size fields.
///
/// Fields are laid out back to back in declaration order. The codec traits and
/// `Error` must be in scope where the derive is used.
#[proc_macro_derive(Codec)]
pub fn derive_codec_fn(item: TokenStream) -> TokenStream {
    let ast = syn::parse_macro_input!(item as DeriveInput);
    expand_codec(&ast).into()
}

fn expand_codec(ast: &DeriveInput) -> TokenStream2 {
    let name = &ast.ident;

    let Data::Struct(data_struct) = &ast.data else {
        return syn::Error::new_spanned(name, "Codec can only be derived for structs").to_compile_error();
    };
    let Fields::Named(fields) = &data_struct.fields else {
        return syn::Error::new_spanned(name, "Codec requires named fields").to_compile_error();
    };

    let mut offsets = Vec::new();
    let mut field_sizes: Vec<_> = Vec::new();
    let mut field_encoders: Vec<_> = Vec::new();
    let mut field_decoders: Vec<_> = Vec::new();

    for f in fields.named.iter() {
        let fname = &f.ident;
        let ftype = &f.ty;
        let fsize = quote! { <#ftype as FixedSize>::SIZE };

        let offset: syn::Expr = if offsets.is_empty() {
            parse_quote! { 0 }
        } else {
            parse_quote! { #(#offsets)+* }
        };
        offsets.push(fsize.clone());

        field_encoders.push(quote! {
            if #offset + #fsize <= dest.len() {
                self.#fname.encode(&mut dest[#offset..#offset + #fsize])?;
            } else {
                return Err(Error::InsufficientSpace);
            }
        });

        field_decoders.push(quote! {
            #fname: if #offset + #fsize <= src.len() {
                <#ftype as Decode<'d>>::decode(&src[#offset..#offset + #fsize])?
            } else {
                return Err(Error::InsufficientSpace);
            },
        });

        field_sizes.push(fsize);
    }

    quote! {
        impl FixedSize for #name {
            const SIZE: usize = #(#field_sizes)+*;
        }

        impl Encode for #name {
            fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
                #(#field_encoders)*
                Ok(())
            }
        }

        impl<'d> Decode<'d> for #name {
            fn decode(src: &'d [u8]) -> Result<Self, Error> {
                Ok(Self {
                    #(#field_decoders)*
                })
            }
        }
    }
}
