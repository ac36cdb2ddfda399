use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod ops;

/// Derives `Operands` for an op struct.
///
/// Fields marked `#[operand]` (optionally `#[operand(name = "...")]`) are the op's
/// tensor inputs, in declaration order. The struct-level `#[operands(...)]` attribute
/// accepts `crate`, `name` (the op name, defaulting to the snake-cased type name
/// without its `Op` suffix) and `bound`.
#[proc_macro_derive(Operands, attributes(operands, operand))]
pub fn derive_operands(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_operands(input);
    expanded.into()
}
