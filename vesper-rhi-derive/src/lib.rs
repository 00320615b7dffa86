#![allow(non_snake_case)]

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{parse_macro_input, spanned::Spanned, Data, DeriveInput, Fields, Lit, Meta, Type, TypeArray, TypePath};

/// Inject `pub(crate) device: ash::Device` and implement the crate's `DeviceObject`.
#[proc_macro_attribute]
pub fn DeviceObject(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as syn::ItemStruct);
    let ident = input.ident.clone();
    let generics = input.generics.clone();
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut output_struct = input.clone();

    let syn::Fields::Named(fields_named) = &mut output_struct.fields else {
        return syn::Error::new(output_struct.span(), "DeviceObject only supports structs with named fields")
            .to_compile_error()
            .into();
    };

    if fields_named.named.iter().any(|f| f.ident.as_ref().is_some_and(|id| id == "device")) {
        return syn::Error::new(
            fields_named.span(),
            "DeviceObject: struct already has a `device` field; the macro injects `pub(crate) device: ash::Device`",
        )
        .to_compile_error()
        .into();
    }

    let device_field: syn::Field = syn::parse_quote! {
        pub(crate) device: ::ash::Device
    };
    fields_named.named.push(device_field);

    let expanded = quote! {
        #output_struct

        impl #impl_generics crate::device::sealed::Sealed for #ident #ty_generics #where_clause {}

        impl #impl_generics crate::device::DeviceObject for #ident #ty_generics #where_clause {
            #[inline]
            fn device(&self) -> &::ash::Device { &self.device }
        }
    };

    expanded.into()
}

/// Derive `vesper_rhi::VertexLayout` for a `#[repr(C)]` struct of `f32` / `[f32; 2..=4]` fields.
///
/// Locations follow field order; all attributes read from vertex binding 0.
#[proc_macro_derive(VertexLayout)]
pub fn derive_vertex_layout(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let ident = input.ident.clone();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    if !has_repr_c(&input.attrs) {
        return syn::Error::new(
            input.span(),
            "VertexLayout requires #[repr(C)] on the vertex struct to ensure stable field offsets",
        )
        .to_compile_error()
        .into();
    }

    let fields = match input.data {
        Data::Struct(s) => match s.fields {
            Fields::Named(named) => named.named,
            Fields::Unnamed(_) | Fields::Unit => {
                return syn::Error::new(ident.span(), "VertexLayout only supports structs with named fields")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "VertexLayout only supports structs")
                .to_compile_error()
                .into();
        }
    };

    let mut attr_inits = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let Some(field_ident) = &field.ident else {
            return syn::Error::new(field.span(), "expected named field").to_compile_error().into();
        };

        let format = match vertex_format_for_type(&field.ty) {
            Ok(ts) => ts,
            Err(e) => return e.to_compile_error().into(),
        };

        let location = i as u32;
        attr_inits.push(quote! {
            ::vesper_rhi::VertexAttribute {
                location: #location,
                binding: 0u32,
                format: #format,
                offset: ::vesper_rhi::memoffset::offset_of!(Self, #field_ident) as u32,
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics ::vesper_rhi::VertexLayout for #ident #ty_generics #where_clause {
            fn vertex_attributes() -> ::std::vec::Vec<::vesper_rhi::VertexAttribute> {
                ::std::vec![#(#attr_inits),*]
            }
        }
    };

    expanded.into()
}

fn has_repr_c(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().filter(|attr| attr.path().is_ident("repr")).any(|attr| {
        attr.parse_args_with(syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated)
            .map(|metas| metas.iter().any(|m| matches!(m, Meta::Path(p) if p.is_ident("C"))))
            .unwrap_or(false)
    })
}

fn vertex_format_for_type(ty: &Type) -> Result<proc_macro2::TokenStream, syn::Error> {
    let unsupported = || {
        syn::Error::new(
            ty.span(),
            format!(
                "unsupported vertex field type `{}` (supported: f32, [f32; 2], [f32; 3], [f32; 4])",
                ty.to_token_stream()
            ),
        )
    };

    match ty {
        Type::Path(TypePath { path, .. }) if path.is_ident("f32") => Ok(quote!(::vesper_rhi::VertexFormat::Float)),
        Type::Array(TypeArray { elem, len, .. }) => {
            let is_f32 = matches!(elem.as_ref(), Type::Path(TypePath { path, .. }) if path.is_ident("f32"));
            let n = match len {
                syn::Expr::Lit(expr_lit) => match &expr_lit.lit {
                    Lit::Int(li) => li.base10_parse::<usize>().ok(),
                    _ => None,
                },
                _ => None,
            }
            .ok_or_else(|| syn::Error::new(len.span(), "array length must be an integer literal"))?;

            match (is_f32, n) {
                (true, 2) => Ok(quote!(::vesper_rhi::VertexFormat::Vec2)),
                (true, 3) => Ok(quote!(::vesper_rhi::VertexFormat::Vec3)),
                (true, 4) => Ok(quote!(::vesper_rhi::VertexFormat::Vec4)),
                _ => Err(unsupported()),
            }
        }
        _ => Err(unsupported()),
    }
}
