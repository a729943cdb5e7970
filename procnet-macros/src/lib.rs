//! Derive macros for `procnet_message`.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

/// Implements `procnet_message::Passable` with the type name as the message tip,
/// and conversion back from `procnet_message::Message`.
///
/// The conversion panics if the message does not carry the type's data,
/// so check [`get_tip`](procnet_message::Message::get_tip) first when it is not known.
#[proc_macro_derive(Passable)]
pub fn derive_passable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    let name = input.ident;
    let result = quote! {
        impl procnet_message::Passable for #name {
            const TIP: &'static str = stringify!(#name);
        }

        impl From<procnet_message::Message> for #name {
            fn from(message: procnet_message::Message) -> Self {
                message.get_data().unwrap()
            }
        }
    };

    result.into()
}
