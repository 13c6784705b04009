//! Procedural macros for cfn-extension-runtime
//!
//! This crate provides `#[derive(CfnModel)]`, which implements
//! `cfn_extension_runtime::Model` for a struct by describing its fields as a
//! `ModelSchema`.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{quote, ToTokens};
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, GenericArgument, LitStr,
    PathArguments, Type,
};

/// Derives `Model` for a struct with named fields.
///
/// Wire names follow the struct's serde attributes: `rename_all` on the
/// struct, `rename` on a field, and fields marked `skip`, `skip_deserializing`
/// or `flatten` are left out of the schema. Field types map as follows:
///
/// - `Option<T>` and `Box<T>` describe `T`, the former as optional
/// - `bool`, integer types, `f32`/`f64` and `String` are primitives
/// - `Vec<T>` and `VecDeque<T>` are lists, `HashSet<T>` and `BTreeSet<T>` are sets
/// - `HashMap<String, T>` and `BTreeMap<String, T>` are maps
/// - `serde_json::Value` passes through untouched
/// - any other named type is a nested model and must itself implement `Model`
///
/// A field marked `#[cfn(any)]` is never recast.
///
/// # Example
///
/// ```rust,ignore
/// use cfn_extension_runtime::CfnModel;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize, CfnModel)]
/// #[serde(rename_all = "PascalCase")]
/// struct Bucket {
///     bucket_name: Option<String>,
///     versioning: Option<Versioning>,
///     #[serde(rename = "Tags")]
///     tag_list: Option<Vec<Tag>>,
///     #[cfn(any)]
///     policy: Option<serde_json::Value>,
/// }
/// ```
#[proc_macro_derive(CfnModel, attributes(cfn))]
pub fn derive_cfn_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input).unwrap_or_else(syn::Error::into_compile_error).into()
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "CfnModel cannot be derived for generic types",
        ));
    }

    let named = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => named,
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "CfnModel requires a struct with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new(
                input.ident.span(),
                "CfnModel can only be derived for structs",
            ))
        }
    };

    let container = SerdeOptions::parse(&input.attrs)?;
    let rename_all = container.rename_all.as_ref().map(RenameRule::parse).transpose()?;

    let mut fields = Vec::new();
    for field in &named.named {
        let options = SerdeOptions::parse(&field.attrs)?;
        if options.skip {
            continue;
        }
        let Some(ident) = &field.ident else {
            continue;
        };

        let raw_name = ident.to_string();
        let raw_name = raw_name.trim_start_matches("r#");
        let wire_name = match (&options.rename, &rename_all) {
            (Some(rename), _) => rename.value(),
            (None, Some(rule)) => rule.apply(raw_name),
            (None, None) => raw_name.to_string(),
        };

        let field_type = if has_cfn_any(&field.attrs)? {
            any_type(&field.ty)
        } else {
            field_type(&field.ty)
        };
        fields.push(quote! {
            ::cfn_extension_runtime::FieldSchema::new(#wire_name, #field_type)
        });
    }

    let name = &input.ident;
    let model_name = container
        .rename
        .map(|rename| rename.value())
        .unwrap_or_else(|| name.to_string());

    Ok(quote! {
        impl ::cfn_extension_runtime::Model for #name {
            fn schema() -> &'static ::cfn_extension_runtime::ModelSchema {
                static SCHEMA: ::std::sync::OnceLock<::cfn_extension_runtime::ModelSchema> =
                    ::std::sync::OnceLock::new();
                SCHEMA.get_or_init(|| {
                    ::cfn_extension_runtime::ModelSchema::new(#model_name, ::std::vec![#(#fields),*])
                })
            }
        }
    })
}

/// The subset of serde attributes that changes the wire shape.
#[derive(Default)]
struct SerdeOptions {
    rename: Option<LitStr>,
    rename_all: Option<LitStr>,
    skip: bool,
}

impl SerdeOptions {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs.iter().filter(|attr| attr.path().is_ident("serde")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    options.rename = Some(parse_directional(&meta)?);
                } else if meta.path.is_ident("rename_all") {
                    options.rename_all = Some(parse_directional(&meta)?);
                } else if meta.path.is_ident("skip")
                    || meta.path.is_ident("skip_deserializing")
                    || meta.path.is_ident("flatten")
                {
                    options.skip = true;
                } else {
                    skip_meta_value(&meta)?;
                }
                Ok(())
            })?;
        }
        Ok(options)
    }
}

/// Reads `key = "value"` or `key(deserialize = "value")`.
///
/// Only the deserialize side matters, since that is the shape being recast.
fn parse_directional(meta: &syn::meta::ParseNestedMeta) -> syn::Result<LitStr> {
    if meta.input.peek(syn::Token![=]) {
        return meta.value()?.parse();
    }
    let mut found = None;
    meta.parse_nested_meta(|inner| {
        let value: LitStr = inner.value()?.parse()?;
        if inner.path.is_ident("deserialize") {
            found = Some(value);
        }
        Ok(())
    })?;
    found.ok_or_else(|| meta.error("expected a deserialize name"))
}

fn skip_meta_value(meta: &syn::meta::ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(syn::Token![=]) {
        meta.value()?.parse::<syn::Expr>()?;
    } else if meta.input.peek(syn::token::Paren) {
        let _content;
        syn::parenthesized!(_content in meta.input);
    }
    Ok(())
}

fn has_cfn_any(attrs: &[Attribute]) -> syn::Result<bool> {
    let mut any = false;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("cfn")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("any") {
                any = true;
                Ok(())
            } else {
                Err(meta.error("unsupported cfn attribute"))
            }
        })?;
    }
    Ok(any)
}

/// `Any`, keeping an outer `Option` so a null stays acceptable.
fn any_type(ty: &Type) -> TokenStream2 {
    match single_generic(ty, &["Option"]) {
        Some(_) => quote!(::cfn_extension_runtime::FieldType::optional(::cfn_extension_runtime::FieldType::Any)),
        None => quote!(::cfn_extension_runtime::FieldType::Any),
    }
}

fn field_type(ty: &Type) -> TokenStream2 {
    let unresolved = || {
        let name = ty.to_token_stream().to_string();
        quote!(::cfn_extension_runtime::FieldType::Unresolved(#name))
    };

    let Type::Path(type_path) = ty else {
        return unresolved();
    };
    if type_path.qself.is_some() {
        return unresolved();
    }
    let Some(last) = type_path.path.segments.last() else {
        return unresolved();
    };

    match last.ident.to_string().as_str() {
        "Option" => match single_generic(ty, &["Option"]) {
            Some(inner) => {
                let inner = field_type(inner);
                quote!(::cfn_extension_runtime::FieldType::optional(#inner))
            }
            None => unresolved(),
        },
        "Box" | "Arc" | "Rc" => match generic_args(last).first() {
            Some(inner) => field_type(inner),
            None => unresolved(),
        },
        "bool" => quote!(::cfn_extension_runtime::FieldType::Bool),
        "i8" | "i16" | "i32" | "i64" | "i128" | "isize" | "u8" | "u16" | "u32" | "u64" | "u128" | "usize" => {
            quote!(::cfn_extension_runtime::FieldType::Int)
        }
        "f32" | "f64" => quote!(::cfn_extension_runtime::FieldType::Float),
        "String" => quote!(::cfn_extension_runtime::FieldType::Str),
        "Value" => quote!(::cfn_extension_runtime::FieldType::Any),
        "Vec" | "VecDeque" => match generic_args(last).first() {
            Some(inner) => {
                let inner = field_type(inner);
                quote!(::cfn_extension_runtime::FieldType::list(#inner))
            }
            None => unresolved(),
        },
        "HashSet" | "BTreeSet" => match generic_args(last).first() {
            Some(inner) => {
                let inner = field_type(inner);
                quote!(::cfn_extension_runtime::FieldType::set(#inner))
            }
            None => unresolved(),
        },
        "HashMap" | "BTreeMap" => match generic_args(last).get(1) {
            Some(value) => {
                let value = field_type(value);
                quote!(::cfn_extension_runtime::FieldType::map(#value))
            }
            None => unresolved(),
        },
        _ if matches!(last.arguments, PathArguments::None) => {
            quote!(::cfn_extension_runtime::FieldType::Model(
                <#ty as ::cfn_extension_runtime::Model>::schema
            ))
        }
        _ => unresolved(),
    }
}

fn generic_args(segment: &syn::PathSegment) -> Vec<&Type> {
    match &segment.arguments {
        PathArguments::AngleBracketed(args) => args
            .args
            .iter()
            .filter_map(|arg| match arg {
                GenericArgument::Type(ty) => Some(ty),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn single_generic<'a>(ty: &'a Type, wrappers: &[&str]) -> Option<&'a Type> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    let last = type_path.path.segments.last()?;
    if !wrappers.iter().any(|wrapper| last.ident == *wrapper) {
        return None;
    }
    generic_args(last).first().copied()
}

/// Field renaming rules understood by serde's `rename_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenameRule {
    Lower,
    Upper,
    Pascal,
    Camel,
    Snake,
    ScreamingSnake,
    Kebab,
    ScreamingKebab,
}

impl RenameRule {
    fn parse(rule: &LitStr) -> syn::Result<Self> {
        Ok(match rule.value().as_str() {
            "lowercase" => Self::Lower,
            "UPPERCASE" => Self::Upper,
            "PascalCase" => Self::Pascal,
            "camelCase" => Self::Camel,
            "snake_case" => Self::Snake,
            "SCREAMING_SNAKE_CASE" => Self::ScreamingSnake,
            "kebab-case" => Self::Kebab,
            "SCREAMING-KEBAB-CASE" => Self::ScreamingKebab,
            other => {
                return Err(syn::Error::new(
                    rule.span(),
                    format!("unknown rename rule `{}`", other),
                ))
            }
        })
    }

    /// Renames a snake_case field identifier.
    fn apply(self, field: &str) -> String {
        match self {
            Self::Lower | Self::Snake => field.to_string(),
            Self::Upper | Self::ScreamingSnake => field.to_ascii_uppercase(),
            Self::Pascal => field
                .split('_')
                .map(|word| {
                    let mut chars = word.chars();
                    match chars.next() {
                        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                        None => String::new(),
                    }
                })
                .collect(),
            Self::Camel => {
                let pascal = Self::Pascal.apply(field);
                let mut chars = pascal.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
            Self::Kebab => field.replace('_', "-"),
            Self::ScreamingKebab => field.replace('_', "-").to_ascii_uppercase(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_rules() {
        assert_eq!(RenameRule::Pascal.apply("bucket_name"), "BucketName");
        assert_eq!(RenameRule::Camel.apply("bucket_name"), "bucketName");
        assert_eq!(RenameRule::ScreamingSnake.apply("bucket_name"), "BUCKET_NAME");
        assert_eq!(RenameRule::Kebab.apply("bucket_name"), "bucket-name");
        assert_eq!(RenameRule::ScreamingKebab.apply("bucket_name"), "BUCKET-NAME");
        assert_eq!(RenameRule::Lower.apply("id"), "id");
    }

    #[test]
    fn test_unknown_rename_rule_is_rejected() {
        let rule = LitStr::new("Title Case", proc_macro2::Span::call_site());
        assert!(RenameRule::parse(&rule).is_err());
    }

    #[test]
    fn test_expand_rejects_enums() {
        let input: DeriveInput = syn::parse_quote! {
            enum Shape { Round, Square }
        };
        assert!(expand(input).is_err());
    }

    #[test]
    fn test_expand_maps_field_types() {
        let input: DeriveInput = syn::parse_quote! {
            #[serde(rename_all = "PascalCase")]
            struct Bucket {
                bucket_name: Option<String>,
                #[serde(rename = "Ports")]
                port_list: Vec<u16>,
                labels: HashMap<String, bool>,
                #[serde(skip)]
                cache: Vec<u8>,
                #[cfn(any)]
                policy: Option<Value>,
                pair: (u8, u8),
            }
        };
        let expanded = expand(input).unwrap().to_string();
        assert!(expanded.contains("\"BucketName\""));
        assert!(expanded.contains("\"Ports\""));
        assert!(expanded.contains("\"Labels\""));
        assert!(!expanded.contains("\"Cache\""));
        assert!(expanded.contains("\"Policy\""));
        assert!(expanded.contains("Unresolved"));
    }

    #[test]
    fn test_expand_nested_model_uses_its_schema() {
        let input: DeriveInput = syn::parse_quote! {
            struct Outer {
                inner: Option<Inner>,
            }
        };
        let expanded = expand(input).unwrap().to_string();
        assert!(expanded.contains("Inner as"));
        assert!(expanded.contains("optional"));
    }
}
