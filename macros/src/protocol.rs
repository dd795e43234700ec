//! `Encode`/`Decode` derives for message bodies and the message
//! union.
//!
//! Structs encode their named fields in declaration order. The union
//! must consist of single-payload tuple variants, each tagged with
//! its message number, plus one `other` variant that keeps unknown
//! messages raw.

use darling::{FromField, FromMeta, FromVariant};
use proc_macro2::{Ident, TokenStream};
use quote::quote;
use syn::{Data, DataEnum, DataStruct, DeriveInput, Fields};

#[derive(Default, Debug, FromField)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
#[darling(default)]
struct FieldOptions {
    /// Network byte order. Only for `u16` ports.
    big_endian: bool,
    length_prefix: Option<LengthPrefix>,
}

/// How the element count of a list field is carried.
#[derive(Debug, Clone, Copy, FromMeta)]
enum LengthPrefix {
    /// One byte: variable-1 fields and variable blocks.
    #[darling(rename = "u8")]
    U8,
    /// Little-endian short: variable-2 fields.
    #[darling(rename = "u16")]
    U16,
    /// Everything up to the end of the body. Last field only.
    #[darling(rename = "inferred")]
    Inferred,
}

#[derive(Debug, FromVariant)]
#[darling(attributes(encoding), forward_attrs(allow, doc, cfg))]
struct VariantOptions {
    #[darling(default)]
    id: Option<u32>,
    #[darling(default)]
    other: bool,
}

/// How one struct field goes on the wire.
enum Layout {
    Plain,
    Port,
    List(LengthPrefix),
}

struct Field {
    ident: Ident,
    layout: Layout,
}

impl Field {
    fn parse(field: &syn::Field) -> syn::Result<Self> {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new_spanned(field, "fields must be named"))?;
        let options = FieldOptions::from_field(field)?;
        let layout = match (options.big_endian, options.length_prefix) {
            (false, None) => Layout::Plain,
            (true, None) => Layout::Port,
            (false, Some(prefix)) => Layout::List(prefix),
            (true, Some(_)) => {
                return Err(syn::Error::new_spanned(
                    &ident,
                    "`big_endian` and `length_prefix` cannot be combined",
                ))
            }
        };
        Ok(Self { ident, layout })
    }

    fn encode(&self) -> TokenStream {
        let ident = &self.ident;
        match self.layout {
            Layout::Plain => quote! {
                crate::protocol::Encode::encode(&self.#ident, encoder);
            },
            Layout::Port => quote! {
                encoder.write_u16_be(self.#ident);
            },
            Layout::List(prefix) => {
                let (write_length, limit) = match prefix {
                    LengthPrefix::U8 => (
                        quote! { encoder.write_u8(self.#ident.len().try_into().unwrap_or(u8::MAX)); },
                        quote! { usize::from(u8::MAX) },
                    ),
                    LengthPrefix::U16 => (
                        quote! { encoder.write_u16(self.#ident.len().try_into().unwrap_or(u16::MAX)); },
                        quote! { usize::from(u16::MAX) },
                    ),
                    LengthPrefix::Inferred => (quote! {}, quote! { usize::MAX }),
                };
                quote! {
                    #write_length
                    for element in self.#ident.iter().take(#limit) {
                        crate::protocol::Encode::encode(element, encoder);
                    }
                }
            }
        }
    }

    fn decode(&self) -> TokenStream {
        let ident = &self.ident;
        match self.layout {
            Layout::Plain => quote! {
                let #ident = crate::protocol::Decode::decode(decoder)?;
            },
            Layout::Port => quote! {
                let #ident = decoder.read_u16_be()?;
            },
            Layout::List(LengthPrefix::Inferred) => quote! {
                let mut #ident = Vec::new();
                while !decoder.is_finished() {
                    #ident.push(crate::protocol::Decode::decode(decoder)?);
                }
            },
            Layout::List(prefix) => {
                let read_length = match prefix {
                    LengthPrefix::U8 => quote! { usize::from(decoder.read_u8()?) },
                    _ => quote! { usize::from(decoder.read_u16()?) },
                };
                quote! {
                    let count = #read_length;
                    let mut #ident = Vec::with_capacity(count.min(decoder.buffer().len()));
                    for _ in 0..count {
                        #ident.push(crate::protocol::Decode::decode(decoder)?);
                    }
                }
            }
        }
    }
}

fn struct_fields(data: &DataStruct) -> syn::Result<Vec<Field>> {
    match &data.fields {
        Fields::Named(named) => named.named.iter().map(Field::parse).collect(),
        Fields::Unit => Ok(Vec::new()),
        Fields::Unnamed(unnamed) => Err(syn::Error::new_spanned(
            unnamed,
            "message bodies must have named fields",
        )),
    }
}

/// A tagged variant of the message union.
struct Variant {
    ident: Ident,
    id: u32,
}

/// The parsed message union.
struct Union {
    variants: Vec<Variant>,
    other: Ident,
}

/// Checks that `id` has a frequency encoding: high (1 byte), medium
/// (`0xFF` + 1 byte) or low/fixed (`0xFFFF` + 2 bytes).
fn is_message_number(id: u32) -> bool {
    matches!(id, 0x01..=0xFE | 0xFF01..=0xFFFE | 0xFFFF_0001..=0xFFFF_FFFF)
}

fn parse_union(data: &DataEnum, input: &DeriveInput) -> syn::Result<Union> {
    let mut variants = Vec::new();
    let mut other = None;
    for variant in &data.variants {
        let options = VariantOptions::from_variant(variant)?;
        if !matches!(&variant.fields, Fields::Unnamed(fields) if fields.unnamed.len() == 1) {
            return Err(syn::Error::new_spanned(
                &variant.ident,
                "variants must hold exactly one payload",
            ));
        }
        match (options.id, options.other) {
            (Some(id), false) if is_message_number(id) => variants.push(Variant {
                ident: variant.ident.clone(),
                id,
            }),
            (Some(id), false) => {
                return Err(syn::Error::new_spanned(
                    &variant.ident,
                    format!("{id:#x} is not a valid message number"),
                ))
            }
            (None, true) if other.is_none() => other = Some(variant.ident.clone()),
            (None, true) => {
                return Err(syn::Error::new_spanned(
                    &variant.ident,
                    "only one variant can be `other`",
                ))
            }
            _ => {
                return Err(syn::Error::new_spanned(
                    &variant.ident,
                    "variant needs exactly one of `id` or `other`",
                ))
            }
        }
    }
    let other = other.ok_or_else(|| {
        syn::Error::new_spanned(&input.ident, "the message union needs an `other` variant")
    })?;
    Ok(Union { variants, other })
}

fn encode_union(union: &Union, ident: &Ident) -> TokenStream {
    let other = &union.other;
    let arms = union.variants.iter().map(|Variant { ident, id }| {
        quote! {
            Self::#ident(body) => {
                encoder.write_message_id(#id);
                crate::protocol::Encode::encode(body, encoder);
            }
        }
    });
    let ids = union
        .variants
        .iter()
        .map(|Variant { ident, id }| quote! { Self::#ident(_) => #id, });

    quote! {
        impl crate::protocol::Encode for #ident {
            fn encode(&self, encoder: &mut crate::protocol::Encoder) {
                match self {
                    #(#arms)*
                    Self::#other(raw) => {
                        encoder.write_message_id(crate::protocol::UnknownMessage::message_id(raw));
                        crate::protocol::UnknownMessage::encode_body(raw, encoder);
                    }
                }
            }
        }

        impl #ident {
            /// Message number of this message.
            pub fn message_id(&self) -> u32 {
                match self {
                    #(#ids)*
                    Self::#other(raw) => crate::protocol::UnknownMessage::message_id(raw),
                }
            }
        }
    }
}

fn decode_union(union: &Union, ident: &Ident) -> TokenStream {
    let other = &union.other;
    let arms = union.variants.iter().map(|Variant { ident, id }| {
        quote! {
            #id => Ok(Self::#ident(crate::protocol::Decode::decode(decoder)?)),
        }
    });

    quote! {
        impl crate::protocol::Decode for #ident {
            fn decode(decoder: &mut crate::protocol::Decoder) -> ::std::result::Result<Self, crate::protocol::DecodeError> {
                let id = decoder.read_message_id()?;
                match id {
                    #(#arms)*
                    _ => Ok(Self::#other(crate::protocol::UnknownMessage::decode_body(id, decoder)?)),
                }
            }
        }
    }
}

pub fn derive_encode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let ident = &input.ident;
    match &input.data {
        Data::Struct(data) => {
            let fields = struct_fields(data)?;
            let encode = fields.iter().map(Field::encode);
            Ok(quote! {
                impl crate::protocol::Encode for #ident {
                    fn encode(&self, encoder: &mut crate::protocol::Encoder) {
                        #(#encode)*
                    }
                }
            })
        }
        Data::Enum(data) => Ok(encode_union(&parse_union(data, input)?, ident)),
        Data::Union(_) => Err(syn::Error::new_spanned(ident, "cannot derive Encode on a union")),
    }
}

pub fn derive_decode_on(input: &DeriveInput) -> syn::Result<TokenStream> {
    let ident = &input.ident;
    match &input.data {
        Data::Struct(data) => {
            let fields = struct_fields(data)?;
            let decode = fields.iter().map(Field::decode);
            let names = fields.iter().map(|field| &field.ident);
            Ok(quote! {
                impl crate::protocol::Decode for #ident {
                    fn decode(decoder: &mut crate::protocol::Decoder) -> ::std::result::Result<Self, crate::protocol::DecodeError> {
                        #(#decode)*
                        Ok(Self { #(#names),* })
                    }
                }
            })
        }
        Data::Enum(data) => Ok(decode_union(&parse_union(data, input)?, ident)),
        Data::Union(_) => Err(syn::Error::new_spanned(ident, "cannot derive Decode on a union")),
    }
}
