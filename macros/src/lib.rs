use proc_macro2::{Span, TokenStream, TokenTree};
use quote::quote;
use syn::{parse_macro_input, Data, DataEnum, DataUnion, DeriveInput, Error, Meta, MetaList};

/// Derives the `Cast` and `Unaligned` marker traits for a wire-format struct.
///
/// The struct must carry an explicit `repr(C)`, `repr(C, packed)`, or
/// `repr(transparent)`. For `repr(C)` a compile-time assertion proves the
/// layout has no padding, and every field must itself be `Unaligned` so the
/// struct's alignment is 1. `repr(packed)` makes both properties structural,
/// so only the per-field `Cast` requirement remains.
#[proc_macro_derive(Cast)]
pub fn bytes(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
	let DeriveInput { attrs, ident: name, generics, data, .. } = parse_macro_input!(item as DeriveInput);

	if !generics.params.is_empty() {
		return Error::new(Span::call_site(), "Generic structs are not supported; implement Cast by hand.")
			.to_compile_error()
			.into();
	}

	// Whether either "C" or "transparent" have been seen
	let mut base = false;
	// One of "C", "packed", or "transparent"
	let mut repr = "C";

	for attr in attrs {
		if let Meta::List(MetaList { path, tokens, .. }) = attr.meta {
			if path.is_ident("repr") {
				for token in tokens.into_iter() {
					match token {
						TokenTree::Punct(_) => continue,
						TokenTree::Ident(ident) if ident == "C" => base = true,
						TokenTree::Ident(ident) if ident == "transparent" => {
							base = true;
							repr = "transparent";
						}
						TokenTree::Ident(ident) if ident == "packed" => repr = "packed",
						_ => return Error::new(token.span(), "Unexpected token").to_compile_error().into(),
					}
				}
			}
		}
	}

	if !base && repr != "packed" {
		return Error::new(Span::call_site(), "Struct needs explicit repr(C) or repr(transparent)")
			.to_compile_error()
			.into();
	};

	let fields: Vec<syn::Type> = match data {
		Data::Struct(obj) => obj.fields.into_iter().map(|f| f.ty).collect(),
		Data::Enum(DataEnum { enum_token, .. }) => return Error::new_spanned(enum_token, "Enums are not supported.").to_compile_error().into(),
		Data::Union(DataUnion { union_token, .. }) => return Error::new_spanned(union_token, "Unions are not supported.").to_compile_error().into(),
	};

	// Cast always needs all of the fields to implement Cast; Unaligned needs
	// the fields to be Unaligned unless the struct is packed.
	let field_unaligned = if repr == "packed" {
		TokenStream::new()
	} else {
		quote! { #( is_unaligned::<#fields>(); )* }
	};

	// repr(C) admits padding between fields; prove there is none.
	let no_padding = if repr == "C" {
		quote! {
			const _: () = assert!(
				::core::mem::size_of::<#name>() == 0 #( + ::core::mem::size_of::<#fields>() )*,
				concat!("padding bytes in ", stringify!(#name)),
			);
		}
	} else {
		TokenStream::new()
	};

	quote! {
		unsafe impl ::utils::bytes::Cast for #name {}
		unsafe impl ::utils::bytes::Unaligned for #name {}

		const _: () = {
			fn is_cast<T: ::utils::bytes::Cast>() {}
			fn is_unaligned<T: ::utils::bytes::Unaligned>() {}

			#[allow(dead_code)]
			fn fields() {
				#( is_cast::<#fields>(); )*
				#field_unaligned
			}
		};

		#no_padding
	}
	.into()
}
