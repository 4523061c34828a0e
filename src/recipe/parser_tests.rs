//! Tests for the recipe parser.

use super::parser::{parse_all_bytes, parse_definition, parse_labels};
use super::{Definition, FileTransfer};
use crate::error::VesselError;

#[test]
fn test_parse_basic_recipe() {
    let recipe = b"Bootstrap: docker\nFrom: busybox\n%post\necho hi\n%labels\nX 1\n";
    let def = parse_definition(recipe).unwrap();

    assert_eq!(def.header.get("bootstrap"), Some(&"docker".to_string()));
    assert_eq!(def.header.get("from"), Some(&"busybox".to_string()));
    assert_eq!(def.build_scripts.post.script, "echo hi\n");
    assert_eq!(def.label("X"), Some("1"));
}

#[test]
fn test_unknown_section_rejected() {
    let recipe = b"Bootstrap: docker\nFrom: busybox\n%extra\nnope\n";
    match parse_definition(recipe) {
        Err(VesselError::InvalidSection { sections }) => {
            assert_eq!(sections, vec!["extra".to_string()]);
        }
        other => panic!("expected invalid section error, got {other:?}"),
    }
}

#[test]
fn test_unknown_app_section_survives_in_custom() {
    let recipe = b"Bootstrap: docker\nFrom: busybox\n%appinstall foo\necho install\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(
        def.custom.get("appinstall foo"),
        Some(&"echo install\n".to_string())
    );
    assert_eq!(def.app_order, vec!["foo".to_string()]);
}

#[test]
fn test_app_section_without_name_rejected() {
    let recipe = b"Bootstrap: docker\n%appinstall\necho install\n";
    assert!(matches!(
        parse_definition(recipe),
        Err(VesselError::RecipeParse { .. })
    ));
}

#[test]
fn test_app_order_records_first_appearance() {
    let recipe = b"Bootstrap: docker\n\
%appinstall bar\necho bar\n\
%appinstall foo\necho foo\n\
%apphelp bar\nhelp for bar\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.app_order, vec!["bar".to_string(), "foo".to_string()]);
}

#[test]
fn test_header_numeric_suffix_fold() {
    let recipe = b"Bootstrap: yum\nOtherUrl2: https://x\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.header.get("otherurl2"), Some(&"https://x".to_string()));

    let bad = b"Bootstrap: yum\nOtherFoo: v\n";
    assert!(matches!(
        parse_definition(bad),
        Err(VesselError::InvalidHeader { .. })
    ));
}

#[test]
fn test_header_line_without_colon_rejected() {
    let recipe = b"Bootstrap: docker\nFrom busybox\n";
    assert!(matches!(
        parse_definition(recipe),
        Err(VesselError::InvalidHeader { .. })
    ));
}

#[test]
fn test_header_continuation() {
    let recipe = b"Bootstrap: docker\nFrom: image\\\n:tag\n%post\nls\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.header.get("from"), Some(&"image:tag".to_string()));
}

#[test]
fn test_header_continuation_with_newline_escape() {
    let recipe = b"Bootstrap: docker\nSetopt: alpha\\n\\\nbeta\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.header.get("setopt"), Some(&"alpha\nbeta".to_string()));
}

#[test]
fn test_header_inline_comment_stripped() {
    let recipe = b"Bootstrap: docker # the agent\nFrom: busybox\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.header.get("bootstrap"), Some(&"docker".to_string()));
}

#[test]
fn test_empty_definition_rejected() {
    assert!(matches!(
        parse_definition(b""),
        Err(VesselError::EmptyDefinition)
    ));
    assert!(matches!(
        parse_definition(b"\n# just a comment\n\n"),
        Err(VesselError::EmptyDefinition)
    ));
}

#[test]
fn test_files_quoting() {
    let recipe = b"Bootstrap: docker\n%files\n\"a b\" c/d\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.files.len(), 1);
    assert_eq!(
        def.files[0].files,
        vec![FileTransfer { src: "a b".to_string(), dst: "c/d".to_string() }]
    );
}

#[test]
fn test_files_missing_dst_means_same_path() {
    let recipe = b"Bootstrap: docker\n%files\n\"a b\" c\nd\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(
        def.files[0].files,
        vec![
            FileTransfer { src: "a b".to_string(), dst: "c".to_string() },
            FileTransfer { src: "d".to_string(), dst: String::new() },
        ]
    );
}

#[test]
fn test_files_blocks_with_same_args_merge() {
    let recipe = b"Bootstrap: docker\n\
%files from=builder\n/a /a\n\
%files\n/host /host\n\
%files from=builder\n/b /b\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.files.len(), 2);

    let builder = &def.files[0];
    assert_eq!(builder.args, "from=builder");
    assert_eq!(builder.stage(), Some("builder"));
    let srcs: Vec<&str> = builder.files.iter().map(|f| f.src.as_str()).collect();
    assert_eq!(srcs, vec!["/a", "/b"]);

    assert_eq!(def.files[1].args, "");
    assert_eq!(def.files[1].stage(), None);
}

#[test]
fn test_files_comment_lines_skipped() {
    let recipe = b"Bootstrap: docker\n%files\n# nothing here\n/etc/motd\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.files[0].files.len(), 1);
}

#[test]
fn test_files_placeholder_token_kept_whole() {
    let recipe = b"Bootstrap: docker\n%files\n/src/{{ name }}.txt /dst\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.files[0].files[0].src, "/src/{{ name }}.txt");
    assert_eq!(def.files[0].files[0].dst, "/dst");
}

#[test]
fn test_repeated_section_concatenates() {
    let recipe = b"Bootstrap: docker\n%post\necho one\n%post\necho two\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.build_scripts.post.script, "echo one\necho two\n");
}

#[test]
fn test_section_args_recorded() {
    let recipe = b"Bootstrap: docker\n%test -q flag\nexit 0\n";
    let def = parse_definition(recipe).unwrap();
    assert_eq!(def.build_scripts.test.args, "-q flag");
    // The single %test body feeds both script sets.
    assert_eq!(def.image_scripts.test, def.build_scripts.test);
}

#[test]
fn test_section_without_header() {
    let recipe = b"%post\necho hi\n";
    let def = parse_definition(recipe).unwrap();
    assert!(def.header.is_empty());
    assert_eq!(def.build_scripts.post.script, "echo hi\n");
}

#[test]
fn test_labels_keep_insertion_order() {
    let labels = parse_labels("B two words\nA 1\nB replaced\n");
    assert_eq!(
        labels,
        vec![
            ("B".to_string(), "replaced".to_string()),
            ("A".to_string(), "1".to_string()),
        ]
    );
}

#[test]
fn test_multi_stage_split() {
    let recipe = b"Bootstrap: docker\nFrom: golang\nStage: build\n%post\nmake\n\
Bootstrap: docker\nFrom: busybox\nStage: final\n%files from=build\n/out /out\n";
    let defs = parse_all_bytes(recipe).unwrap();
    assert_eq!(defs.len(), 2);
    assert_eq!(defs[0].stage_name(), "build");
    assert_eq!(defs[1].stage_name(), "final");
    for def in &defs {
        assert_eq!(def.full_raw, recipe.to_vec());
    }
}

#[test]
fn test_multi_stage_full_raw_is_concat_of_raw() {
    let recipe = b"Bootstrap: scratch\nStage: one\n%post\ntrue\n\
bootstrap: scratch\nStage: two\n%post\nfalse\n";
    let defs = parse_all_bytes(recipe).unwrap();
    assert_eq!(defs.len(), 2);
    let concat: Vec<u8> = defs.iter().flat_map(|d| d.raw.clone()).collect();
    assert_eq!(concat, recipe.to_vec());
}

#[test]
fn test_multi_stage_preamble_comment_skipped() {
    let recipe = b"# build recipe\nBootstrap: scratch\n%post\ntrue\n";
    let defs = parse_all_bytes(recipe).unwrap();
    assert_eq!(defs.len(), 1);
}

#[test]
fn test_no_stages_error() {
    assert!(matches!(
        parse_all_bytes(b"\n\n"),
        Err(VesselError::NoStages)
    ));
}

#[test]
fn test_render_round_trip() {
    let recipe = b"Bootstrap: docker\nFrom: busybox\n\
%help\nA help message\n\
%post\necho building\n\
%environment\nexport FOO=bar\n\
%labels\nMaintainer hpc-team\nVersion 2\n\
%files\n\"a b\" c\nd\n\
%runscript\nexec \"$@\"\n";
    let def = parse_definition(recipe).unwrap();
    let rendered = def.render();
    let reparsed = parse_definition(rendered.as_bytes()).unwrap();
    assert!(
        def.same_content(&reparsed),
        "round trip changed content:\n{rendered}"
    );
}

#[test]
fn test_from_uri() {
    let def = Definition::from_uri("docker://alpine:3.19").unwrap();
    assert_eq!(def.header.get("bootstrap"), Some(&"docker".to_string()));
    assert_eq!(def.header.get("from"), Some(&"alpine:3.19".to_string()));
    assert!(Definition::from_uri("not-a-uri").is_err());
}

#[test]
fn test_is_valid_uri() {
    assert!(Definition::is_valid_uri("docker://alpine"));
    assert!(Definition::is_valid_uri("library://user/proj/img:tag"));
    assert!(!Definition::is_valid_uri("ftp://host/file"));
    assert!(!Definition::is_valid_uri("/path/to/recipe"));
}
