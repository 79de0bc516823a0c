//! Procedural macros for dbstore
//!
//! - `#[derive(Entity)]` - Generate the field descriptor and accessors of a persisted struct

use convert_case::{Case, Casing};
use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse_macro_input, Data, DeriveInput, Fields, GenericArgument, LitStr, PathArguments, Type,
};

/// Register a struct as a store entity.
///
/// # Usage
///
/// ```ignore
/// #[derive(Entity, Default, Debug, Clone)]
/// #[store(rename_all = "camelCase")]
/// pub struct Person {
///     #[store(primary_key, auto)]
///     pub id: i64,
///     #[store(key = "full_name")]
///     pub name: String,
///     #[store(from_str)]
///     pub status: Status,
///     pub created_at: DateTime<Utc>,
///     #[store(ignore)]
///     pub scratch: String,
/// }
/// ```
///
/// Field attributes:
///
/// - `key = "..."` - storage key (defaults to the field name, cased by `rename_all`)
/// - `primary_key` - primary key (defaults to the field named `id`)
/// - `auto` - the backend generates the key when it is unset
/// - `created` / `updated` - lifecycle timestamps (default: naming convention)
/// - `from_str` - convert through `FromStr` and `Display` instead of `FromValue`/`ToValue`
/// - `ignore` - not persisted
///
/// # Generated Code
///
/// ```ignore
/// impl ::dbstore::Entity for Person {
///     fn describe() -> ::dbstore::EntityDescriptor { /* fields, keys, markers */ }
///     fn get(&self, field: &str) -> Option<::dbstore::Value> { /* per-field ToValue */ }
///     fn set(&mut self, field: &str, value: ::dbstore::Value) -> Result<(), ::dbstore::CoercionError> { /* per-field FromValue */ }
/// }
/// ```
#[proc_macro_derive(Entity, attributes(store))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

/// Options parsed from one field's `#[store(...)]` attributes
#[derive(Default)]
struct FieldOptions {
    key: Option<String>,
    primary_key: bool,
    auto: bool,
    created: bool,
    updated: bool,
    from_str: bool,
    ignore: bool,
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let ident = &input.ident;
    let type_name = ident.to_string();

    let rename_all = struct_case(&input)?;

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(ident, "Entity can only be derived for structs"));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new_spanned(ident, "Entity requires named fields"));
    };

    let mut descriptors = Vec::new();
    let mut ignored = Vec::new();
    let mut getters = Vec::new();
    let mut setters = Vec::new();

    for field in &named.named {
        let Some(field_ident) = &field.ident else {
            continue;
        };
        let name = field_ident.to_string();
        let options = field_options(field)?;

        if options.ignore {
            ignored.push(name);
            continue;
        }

        let key = match (&options.key, rename_all) {
            (Some(key), _) => key.clone(),
            (None, Some(case)) => name.to_case(case),
            (None, None) => name.clone(),
        };

        let mut descriptor = quote! { ::dbstore::FieldDescriptor::new(#name, #key) };
        if options.primary_key {
            descriptor = quote! { #descriptor.primary_key() };
        }
        if options.auto {
            descriptor = quote! { #descriptor.auto_generated() };
        }
        if options.created {
            descriptor = quote! { #descriptor.created() };
        }
        if options.updated {
            descriptor = quote! { #descriptor.updated() };
        }
        descriptors.push(descriptor);

        let optional = is_option(&field.ty);
        let (get, set) = match (options.from_str, optional) {
            (true, true) => (
                quote! { ::dbstore::entity::coerce::display_value_opt(&self.#field_ident) },
                quote! { ::dbstore::entity::coerce::from_str_value_opt(value)? },
            ),
            (true, false) => (
                quote! { ::dbstore::entity::coerce::display_value(&self.#field_ident) },
                quote! { ::dbstore::entity::coerce::from_str_value(value)? },
            ),
            (false, _) => (
                quote! { ::dbstore::ToValue::to_value(&self.#field_ident) },
                quote! { ::dbstore::FromValue::from_value(value)? },
            ),
        };
        getters.push(quote! { #name => ::std::option::Option::Some(#get), });
        setters.push(quote! { #name => self.#field_ident = #set, });
    }

    if descriptors.is_empty() {
        return Err(syn::Error::new_spanned(ident, "Entity needs at least one persisted field"));
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::dbstore::Entity for #ident #ty_generics #where_clause {
            fn describe() -> ::dbstore::EntityDescriptor {
                ::dbstore::EntityDescriptor::new(
                    #type_name,
                    ::std::vec![#(#descriptors),*],
                    ::std::vec![#(#ignored),*],
                )
            }

            fn get(&self, field: &str) -> ::std::option::Option<::dbstore::Value> {
                match field {
                    #(#getters)*
                    _ => ::std::option::Option::None,
                }
            }

            fn set(
                &mut self,
                field: &str,
                value: ::dbstore::Value,
            ) -> ::std::result::Result<(), ::dbstore::CoercionError> {
                match field {
                    #(#setters)*
                    other => return ::std::result::Result::Err(::dbstore::CoercionError::unknown_field(other)),
                }
                ::std::result::Result::Ok(())
            }
        }
    })
}

/// Parse `#[store(rename_all = "...")]` on the struct
fn struct_case(input: &DeriveInput) -> syn::Result<Option<Case>> {
    let mut case = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("store")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") {
                let lit: LitStr = meta.value()?.parse()?;
                case = Some(parse_case(&lit)?);
                Ok(())
            } else {
                Err(meta.error("unsupported struct attribute; expected `rename_all`"))
            }
        })?;
    }
    Ok(case)
}

fn parse_case(lit: &LitStr) -> syn::Result<Case> {
    Ok(match lit.value().as_str() {
        "snake_case" => Case::Snake,
        "camelCase" => Case::Camel,
        "PascalCase" => Case::Pascal,
        "SCREAMING_SNAKE_CASE" => Case::UpperSnake,
        "kebab-case" => Case::Kebab,
        "lowercase" => Case::Flat,
        "UPPERCASE" => Case::UpperFlat,
        other => {
            return Err(syn::Error::new_spanned(
                lit,
                format!("unknown rename_all case `{}`", other),
            ));
        }
    })
}

/// Parse every `#[store(...)]` attribute on a field
fn field_options(field: &syn::Field) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("store")) {
        attr.parse_nested_meta(|meta| {
            let path = &meta.path;
            if path.is_ident("key") {
                let lit: LitStr = meta.value()?.parse()?;
                options.key = Some(lit.value());
            } else if path.is_ident("primary_key") {
                options.primary_key = true;
            } else if path.is_ident("auto") {
                options.auto = true;
            } else if path.is_ident("created") {
                options.created = true;
            } else if path.is_ident("updated") {
                options.updated = true;
            } else if path.is_ident("from_str") {
                options.from_str = true;
            } else if path.is_ident("ignore") {
                options.ignore = true;
            } else {
                return Err(meta.error("unsupported store attribute"));
            }
            Ok(())
        })?;
    }
    Ok(options)
}

/// True for `Option<T>` (also spelled with a path prefix)
fn is_option(ty: &Type) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    path.path.segments.last().is_some_and(|segment| {
        segment.ident == "Option"
            && matches!(
                &segment.arguments,
                PathArguments::AngleBracketed(args)
                    if matches!(args.args.first(), Some(GenericArgument::Type(_)))
            )
    })
}
