use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

/// Converts `ConcatOp` into `concat`, `MatMulOp` into `mat_mul`.
fn op_name(ident: &syn::Ident) -> String {
    let name = ident.to_string();
    let name = name.strip_suffix("Op").unwrap_or(&name);
    let mut output = String::with_capacity(name.len() + 4);
    for (index, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if index > 0 {
                output.push('_');
            }
            output.extend(c.to_lowercase());
        } else {
            output.push(c);
        }
    }
    output
}

pub fn derive_operands(input: DeriveInput) -> TokenStream {
    // retrieve struct field information
    let fields = match &input.data {
        syn::Data::Struct(data_struct) => &data_struct.fields,
        _ => {
            return syn::Error::new(input.span(), "`Operands` can only be derived for structs")
                .to_compile_error();
        }
    };

    // collect the fields marked as operands, with optional renames
    let mut operands = vec![];
    match fields {
        Fields::Named(fields_named) => {
            for field in &fields_named.named {
                let Some(attr) = field.attrs.iter().find(|a| a.path().is_ident("operand")) else {
                    continue;
                };
                let Some(ident) = field.ident.clone() else {
                    continue;
                };
                let mut name = ident.to_string();
                if let syn::Meta::List(_) = &attr.meta {
                    let result = attr.parse_nested_meta(|meta| {
                        if meta.path.is_ident("name") {
                            let value = meta.value()?;
                            let s: LitStr = value.parse()?;
                            name = s.value();
                            Ok(())
                        } else {
                            Err(meta.error("unexpected attribute; supported is `name`"))
                        }
                    });
                    if let Err(err) = result {
                        return err.to_compile_error();
                    }
                }
                operands.push((ident, name));
            }
        }
        _ => {
            return syn::Error::new(
                input.span(),
                "only structs with named fields are supported by `Operands` derive",
            )
            .to_compile_error();
        }
    }

    // parse operands attributes
    let mut crate_name = None;
    let mut op_label = None;
    let mut user_bounds = Punctuated::<WherePredicate, Token![,]>::new();
    for attr in &input.attrs {
        if !attr.path().is_ident("operands") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                crate_name = Some(s.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("name") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                op_label = Some(s.value());
                Ok(())
            } else if meta.path.is_ident("bound") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                let predicates =
                    s.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                user_bounds.extend(predicates);
                Ok(())
            } else {
                Err(meta.error("unexpected attribute; supported are `crate`, `name` and `bound`"))
            }
        });

        if let Err(err) = result {
            return err.to_compile_error();
        }
    }

    // determine the base path for trait implementation
    let base_path = match crate_name {
        Some(path) => quote!(#path::loom::ops),
        None => quote!(::weft::loom::ops),
    };

    let name = &input.ident;
    let op_label = op_label.unwrap_or_else(|| op_name(name));

    // handle struct generics
    let generics = &input.generics;
    let (impl_generics, ty_generics, _) = generics.split_for_impl();

    // prepare where clause
    let mut generics = generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(user_bounds);

    let operands = operands.iter().map(|(ident, name)| {
        quote! {
            #base_path::Operand { name: #name, tensor: &self.#ident }
        }
    });

    quote! {
        impl #impl_generics #base_path::Operands for #name #ty_generics #where_clause {
            fn name(&self) -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed(#op_label)
            }

            fn operands(&self) -> Vec<#base_path::Operand<'_>> {
                vec![#(#operands),*]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proc_macro2::Span;
    use syn::Ident;

    use super::op_name;

    #[test]
    fn test_op_name() {
        let name = |s: &str| op_name(&Ident::new(s, Span::call_site()));
        assert_eq!(name("SoftmaxOp"), "softmax");
        assert_eq!(name("MatMulOp"), "mat_mul");
        assert_eq!(name("Reshape"), "reshape");
    }
}
