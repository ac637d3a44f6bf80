use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Type, parse_macro_input};

/// Derive `metrics_set(&self) -> crate::metric::MetricsSet` for a struct whose fields
/// are all `Count` or `Time` metrics. The field name is used as the metric name
#[proc_macro_derive(MetricsSetBuilder)]
pub fn metrics_set_derive(input: TokenStream) -> TokenStream {
    // Parse the input tokens into a syntax tree.
    let input = parse_macro_input!(input as DeriveInput);

    // Used in the quasi-quotation below as `#name`.
    let name = input.ident;

    let insert_recursion = insert_recursion(&input.data);

    let expanded = quote!(
        impl #name {
            /// Snapshot of the metrics
            pub fn metrics_set(&self) -> crate::metric::MetricsSet {
                let mut metrics = std::collections::BTreeMap::new();
                #insert_recursion
                crate::metric::MetricsSet {
                    name: stringify!(#name),
                    metrics,
                }
            }
        }
    );

    expanded.into()
}

fn insert_recursion(data: &Data) -> proc_macro2::TokenStream {
    match *data {
        Data::Struct(ref ds) => match ds.fields {
            Fields::Named(ref fields) => {
                let recurse = fields.named.iter().map(|f| {
                    let name = f.ident.as_ref().unwrap();
                    let variant = metric_variant(&f.ty);
                    quote! {
                        metrics.insert(
                            stringify!(#name),
                            crate::metric::MetricValue::#variant(self.#name.value()),
                        );
                    }
                });
                quote! {
                    #(#recurse)*
                }
            }
            _ => panic!("MetricsSet can only be derived for structs with named fields"),
        },
        Data::Enum(_) | Data::Union(_) => {
            panic!("MetricsSet can only be derived for structs with named fields")
        }
    }
}

/// Last path segment of the field type, `metric::Count` and `Count` are both `Count`
fn metric_variant(ty: &Type) -> proc_macro2::Ident {
    match ty {
        Type::Path(type_path) => type_path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.clone())
            .expect("Metric field type should have at least one path segment"),
        _ => panic!("Metric field should be `Count` or `Time`"),
    }
}
