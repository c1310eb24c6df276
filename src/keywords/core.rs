use crate::vocabulary::{KeywordDefinition, SubschemaKind, Vocabulary};

/// Identity and reference keywords. Protected: `$ref` and `$id` are
/// interpreted by the compiler and resolver directly.
pub fn core() -> Vocabulary {
    Vocabulary::new(
        "core",
        vec![
            KeywordDefinition::annotation("$id"),
            KeywordDefinition::annotation("$schema"),
            KeywordDefinition::annotation("$ref"),
            KeywordDefinition::annotation("$comment"),
            KeywordDefinition::annotation("$async"),
            KeywordDefinition::annotation("definitions").subschemas(SubschemaKind::Map),
        ],
    )
    .protected()
}

/// Keywords with no effect on validation
pub fn annotations() -> Vocabulary {
    let names = [
        "title",
        "description",
        "default",
        "examples",
        "readOnly",
        "writeOnly",
        "contentMediaType",
        "contentEncoding",
    ];
    Vocabulary::new(
        "annotations",
        names.into_iter().map(KeywordDefinition::annotation).collect(),
    )
}
