//! Annotation expansion through the public API.

use mits_core::template::{AnnotationMap, TemplateError, TemplateExpander};

fn braces() -> TemplateExpander {
    TemplateExpander::with_delimiters("{", "}").unwrap()
}

#[test]
fn literal_value() {
    let map = AnnotationMap::new().with("A", "value");
    assert_eq!(braces().expand("{A}", &map).unwrap(), "value");
}

#[test]
fn chained_values_reach_fixed_point() {
    let map = AnnotationMap::new()
        .with("A", "{B}")
        .with("B", "{C}")
        .with("C", "done");
    assert_eq!(braces().expand("{A}", &map).unwrap(), "done");
}

#[test]
fn self_reference_is_left_verbatim() {
    let map = AnnotationMap::new().with("A", "{A}");
    assert_eq!(braces().expand("{A}", &map).unwrap(), "{A}");
}

#[test]
fn unknown_annotation_is_fatal() {
    let map = AnnotationMap::new().with("A", "a");
    let err = braces().expand("path {A}/{X}", &map).unwrap_err();
    assert!(matches!(err, TemplateError::UnknownAnnotation { token } if token == "{X}"));
}

#[test]
fn two_token_cycle_is_reported() {
    let map = AnnotationMap::new().with("A", "x{B}").with("B", "y{A}");
    let err = braces().expand("{A}", &map).unwrap_err();
    assert!(matches!(err, TemplateError::CyclicAnnotation { .. }));
}

#[test]
fn overlapping_tokens_expand_consistently() {
    // `{ROOT}` is a prefix of `{ROOT_DIR}` minus the closing delimiter, and
    // `{DIR}` introduces `{ROOT_DIR}` mid-pass: every occurrence still ends
    // up fully expanded.
    let map = AnnotationMap::new()
        .with("ROOT", "/srv")
        .with("ROOT_DIR", "{ROOT}/dir")
        .with("DIR", "{ROOT_DIR}/sub");
    let text = "{DIR} {ROOT_DIR} {ROOT} {DIR}";
    assert_eq!(
        braces().expand(text, &map).unwrap(),
        "/srv/dir/sub /srv/dir /srv /srv/dir/sub"
    );

    let shuffled = "{ROOT} {DIR} {ROOT_DIR}";
    assert_eq!(
        braces().expand(shuffled, &map).unwrap(),
        "/srv /srv/dir/sub /srv/dir"
    );
}

#[test]
fn policy_style_delimiters() {
    let map = AnnotationMap::new()
        .with("TESTING_PATH", "/tmp/mits")
        .with("RESTRICTED_PATH", "@{TESTING_PATH}/restricted");
    let text = "space restricted = recursive \"@{RESTRICTED_PATH}\";";
    assert_eq!(
        TemplateExpander::new().expand(text, &map).unwrap(),
        "space restricted = recursive \"/tmp/mits/restricted\";"
    );
}

#[test]
fn bytes_must_be_text() {
    let map = AnnotationMap::new();
    assert!(matches!(
        TemplateExpander::new().expand_bytes(&[0xfe, 0xff], &map),
        Err(TemplateError::InvalidInput(_))
    ));
    assert_eq!(
        TemplateExpander::new().expand_bytes(b"plain", &map).unwrap(),
        "plain"
    );
}
