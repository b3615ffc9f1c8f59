use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, Ident, LitBool, LitStr, Type, parse_macro_input, spanned::Spanned};

/// Derives `Persistable` and `PersistableClass` for a struct with named
/// fields. The struct needs one `#[persistable(state)] StateSlot` field and
/// must implement `Default` and `Clone`.
#[proc_macro_derive(Persistable, attributes(persistable))]
pub fn derive_persistable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_persistable(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct ClassOptions {
    class_name: Option<String>,
    identity: Option<String>,
    version: Option<String>,
    detachable: bool,
    cacheable: Option<bool>,
    extends: Option<String>,
}

#[derive(Default)]
struct FieldOptions {
    primary_key: bool,
    version: bool,
    lazy: bool,
    default_fetch_group: bool,
    fetch_groups: Vec<String>,
    dependent: bool,
    embedded: bool,
    target: Option<String>,
    mapped_by: Option<String>,
    converter: Option<String>,
    value_strategy: Option<String>,
    skip: bool,
    state: bool,
}

struct PersistentField {
    ident: Ident,
    ty: Type,
    options: FieldOptions,
}

fn expand_persistable(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Persistable does not support generic structs",
        ));
    }

    let class_options = parse_class_options(&input.attrs)?;

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Persistable can only be derived for structs",
            ));
        }
    };
    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Persistable requires named fields",
            ));
        }
    };

    let mut state_field: Option<Ident> = None;
    let mut fields = Vec::<PersistentField>::new();
    for field in named_fields.named {
        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Persistable requires named fields"))?;
        let options = parse_field_options(&field.attrs)?;
        if options.state {
            if state_field.is_some() {
                return Err(syn::Error::new(
                    field.span(),
                    "Only one #[persistable(state)] field is allowed",
                ));
            }
            state_field = Some(ident);
            continue;
        }
        if options.skip {
            continue;
        }
        fields.push(PersistentField {
            ident,
            ty: field.ty,
            options,
        });
    }

    let state_field = state_field.ok_or_else(|| {
        syn::Error::new(
            struct_name.span(),
            "Persistable requires a `#[persistable(state)] state: StateSlot` field",
        )
    })?;
    if fields.is_empty() {
        return Err(syn::Error::new(
            struct_name.span(),
            "Persistable requires at least one persistent field",
        ));
    }

    let class_name = class_options
        .class_name
        .clone()
        .unwrap_or_else(|| struct_name.to_string());
    let field_count = fields.len();

    let identity = match class_options.identity.as_deref() {
        None | Some("application") => quote! { ::memorm::metadata::IdentityStrategy::Application },
        Some("native") => quote! { ::memorm::metadata::IdentityStrategy::Native },
        Some("uuid") => quote! { ::memorm::metadata::IdentityStrategy::Uuid },
        Some(other) => {
            return Err(syn::Error::new(
                struct_name.span(),
                format!("Unknown identity strategy `{other}`. Supported: application, native, uuid"),
            ));
        }
    };
    let versioned = match class_options.version.as_deref() {
        None => quote! {},
        Some("number") => quote! { .versioned(::memorm::metadata::VersionStrategy::Number) },
        Some("timestamp") | Some("date_time") => {
            quote! { .versioned(::memorm::metadata::VersionStrategy::DateTime) }
        }
        Some(other) => {
            return Err(syn::Error::new(
                struct_name.span(),
                format!("Unknown version strategy `{other}`. Supported: number, timestamp"),
            ));
        }
    };
    let detachable = class_options.detachable;
    let cacheable = class_options.cacheable.unwrap_or(true);
    let extends = match &class_options.extends {
        Some(parent) => quote! { .extends(#parent) },
        None => quote! {},
    };

    let mut field_consts = Vec::new();
    let mut field_metadata = Vec::new();
    let mut provide_arms = Vec::new();
    let mut replace_arms = Vec::new();

    for (number, field) in fields.iter().enumerate() {
        let ident = &field.ident;
        let ty = &field.ty;
        let name = ident.to_string();
        let const_name = format_ident!("FIELD_{}", name.to_uppercase());
        let options = &field.options;

        field_consts.push(quote! {
            pub const #const_name: usize = #number;
        });

        let mut builder = quote! {
            ::memorm::metadata::FieldMetadata::new(
                #name,
                #number,
                <#ty as ::memorm::core::TypedField>::FIELD_TYPE,
            )
            .nullable(<#ty as ::memorm::core::TypedField>::NULLABLE)
        };
        if options.primary_key {
            builder = quote! { #builder.primary_key() };
        }
        if options.version {
            builder = quote! { #builder.version() };
        }
        if options.lazy {
            builder = quote! { #builder.default_fetch_group(false) };
        }
        if options.default_fetch_group {
            builder = quote! { #builder.default_fetch_group(true) };
        }
        for group in &options.fetch_groups {
            builder = quote! { #builder.fetch_group(#group) };
        }
        if options.dependent {
            builder = quote! { #builder.dependent() };
        }
        if options.embedded {
            builder = quote! { #builder.embedded() };
        }
        if let Some(target) = &options.target {
            builder = quote! { #builder.target(#target) };
        }
        if let Some(mapped_by) = &options.mapped_by {
            builder = quote! { #builder.mapped_by(#mapped_by) };
        }
        if let Some(converter) = &options.converter {
            builder = quote! { #builder.converter(#converter) };
        }
        match options.value_strategy.as_deref() {
            None => {}
            Some("uuid") => {
                builder = quote! { #builder.value_strategy(::memorm::metadata::ValueStrategy::Uuid) };
            }
            Some("sequence") => {
                builder =
                    quote! { #builder.value_strategy(::memorm::metadata::ValueStrategy::Sequence) };
            }
            Some(other) => {
                return Err(syn::Error::new(
                    ident.span(),
                    format!("Unknown value strategy `{other}`. Supported: uuid, sequence"),
                ));
            }
        }
        field_metadata.push(quote! { .field(#builder) });

        provide_arms.push(quote! {
            #number => ::memorm::core::IntoFieldValue::to_field_value(&self.#ident),
        });
        replace_arms.push(quote! {
            #number => {
                self.#ident = ::memorm::core::FromFieldValue::from_field_value(value)?;
                Ok(())
            }
        });
    }

    Ok(quote! {
        impl #struct_name {
            #(#field_consts)*
        }

        impl ::memorm::state::Persistable for #struct_name {
            fn class_name(&self) -> &'static str {
                #class_name
            }

            fn field_count(&self) -> usize {
                #field_count
            }

            fn provide_field(&self, field: usize) -> ::memorm::core::FieldValue {
                match field {
                    #(#provide_arms)*
                    _ => ::memorm::core::FieldValue::Null,
                }
            }

            fn replace_field(
                &mut self,
                field: usize,
                value: ::memorm::core::FieldValue,
            ) -> ::memorm::core::Result<()> {
                match field {
                    #(#replace_arms)*
                    _ => Err(::memorm::core::PersistenceError::UnknownField {
                        class: #class_name.to_string(),
                        field: field.to_string(),
                    }),
                }
            }

            fn state_slot(&self) -> &::memorm::state::StateSlot {
                &self.#state_field
            }

            fn state_slot_mut(&mut self) -> &mut ::memorm::state::StateSlot {
                &mut self.#state_field
            }

            fn new_instance(&self) -> ::std::boxed::Box<dyn ::memorm::state::Persistable> {
                ::std::boxed::Box::new(<Self as ::std::default::Default>::default())
            }

            fn clone_boxed(&self) -> ::std::boxed::Box<dyn ::memorm::state::Persistable> {
                ::std::boxed::Box::new(<Self as ::std::clone::Clone>::clone(self))
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn into_any(self: ::std::boxed::Box<Self>) -> ::std::boxed::Box<dyn ::std::any::Any> {
                self
            }
        }

        impl ::memorm::state::PersistableClass for #struct_name {
            const CLASS_NAME: &'static str = #class_name;

            fn class_metadata() -> ::memorm::metadata::ClassMetadata {
                ::memorm::metadata::ClassMetadata::new(#class_name)
                    .identity(#identity)
                    #versioned
                    .detachable(#detachable)
                    .cacheable(#cacheable)
                    #extends
                    #(#field_metadata)*
            }

            fn new_boxed() -> ::std::boxed::Box<dyn ::memorm::state::Persistable> {
                ::std::boxed::Box::new(<Self as ::std::default::Default>::default())
            }
        }
    })
}

fn parse_class_options(attrs: &[syn::Attribute]) -> syn::Result<ClassOptions> {
    let mut options = ClassOptions::default();

    for attr in attrs {
        if !attr.path().is_ident("persistable") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("class") {
                let lit: LitStr = meta.value()?.parse()?;
                options.class_name = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("identity") {
                let lit: LitStr = meta.value()?.parse()?;
                options.identity = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("version") {
                let lit: LitStr = meta.value()?.parse()?;
                options.version = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("detachable") {
                options.detachable = true;
                return Ok(());
            }
            if meta.path.is_ident("cacheable") {
                let lit: LitBool = meta.value()?.parse()?;
                options.cacheable = Some(lit.value());
                return Ok(());
            }
            if meta.path.is_ident("extends") {
                let lit: LitStr = meta.value()?.parse()?;
                options.extends = Some(lit.value());
                return Ok(());
            }

            Err(meta.error(
                "Unsupported persistable class option. Supported: class = \"..\", identity = \"..\", version = \"..\", detachable, cacheable = <bool>, extends = \"..\"",
            ))
        })?;
    }

    Ok(options)
}

fn parse_field_options(attrs: &[syn::Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();

    for attr in attrs {
        if !attr.path().is_ident("persistable") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            let flags = [
                ("primary_key", &mut options.primary_key),
                ("version", &mut options.version),
                ("lazy", &mut options.lazy),
                ("default_fetch_group", &mut options.default_fetch_group),
                ("dependent", &mut options.dependent),
                ("embedded", &mut options.embedded),
                ("skip", &mut options.skip),
                ("state", &mut options.state),
            ];
            for (name, flag) in flags {
                if meta.path.is_ident(name) {
                    *flag = true;
                    return Ok(());
                }
            }

            if meta.path.is_ident("fetch_group") {
                let lit: LitStr = meta.value()?.parse()?;
                options.fetch_groups.push(lit.value());
                return Ok(());
            }
            let values = [
                ("target", &mut options.target),
                ("mapped_by", &mut options.mapped_by),
                ("converter", &mut options.converter),
                ("value_strategy", &mut options.value_strategy),
            ];
            for (name, slot) in values {
                if meta.path.is_ident(name) {
                    let lit: LitStr = meta.value()?.parse()?;
                    *slot = Some(lit.value());
                    return Ok(());
                }
            }

            Err(meta.error(
                "Unsupported persistable field option. Supported: primary_key, version, lazy, default_fetch_group, fetch_group = \"..\", dependent, embedded, target = \"..\", mapped_by = \"..\", converter = \"..\", value_strategy = \"..\", skip, state",
            ))
        })?;

        if options.skip && options.state {
            return Err(syn::Error::new(
                attr.span(),
                "#[persistable(skip)] cannot be combined with #[persistable(state)]",
            ));
        }
        if options.lazy && options.default_fetch_group {
            return Err(syn::Error::new(
                attr.span(),
                "#[persistable(lazy)] cannot be combined with #[persistable(default_fetch_group)]",
            ));
        }
    }

    Ok(options)
}
