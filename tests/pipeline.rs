//! End-to-end runs against a synthetic MZ executable.

use std::collections::BTreeSet;

use rstest::rstest;

use retrodec::format::OutputFormat;
use retrodec::pipeline::{save_output, Decompiler, Options};

/// 64-byte MZ header followed by `payload` as the code segment.
fn synthetic_mz(payload: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; 64];
    image[0] = b'M';
    image[1] = b'Z';
    image[8] = 4; // header paragraphs
    image.extend_from_slice(payload);
    image
}

/// Entry calls a helper, loops over a counter and references a resource
/// filename; the helper flips a state word.
fn game_like_payload() -> Vec<u8> {
    let mut payload = vec![
        // entry (0x40):
        0xE8, 0x0F, 0x00, // call 0x52
        0xB9, 0x05, 0x00, // mov cx, 5
        0x49, // 0x46: dec cx
        0x75, 0xFD, // jne 0x46
        0x83, 0x3E, 0x00, 0x02, 0x01, // cmp word ptr [0x200], 1
        0xBE, 0x5D, 0x00, // mov si, 0x5D
        0xC3, // ret
        // sub_52:
        0x55, // push bp
        0x89, 0xE5, // mov bp, sp
        0xC7, 0x06, 0x00, 0x02, 0x02, 0x00, // mov word ptr [0x200], 2
        0x5D, // pop bp
        0xC3, // ret
    ];
    // string table at 0x5D
    payload.extend_from_slice(b"TITLE.PC8\0");
    payload
}

#[test]
fn decompiles_synthetic_game_image() {
    let image = synthetic_mz(&game_like_payload());
    let report = Decompiler::new(image, "game.exe", Options::default())
        .decompile()
        .unwrap();

    assert_eq!(report.entry_point, 0x40);
    let names: BTreeSet<&str> = report.functions.iter().map(|f| f.name.as_str()).collect();
    assert!(names.contains("entry"));
    assert!(names.contains("sub_52"));
    assert!(report.failed_analyzers.is_empty());

    // the dec/jne pair forms a loop in the entry function
    let entry = report.functions.iter().find(|f| f.name == "entry").unwrap();
    assert!(!entry.structures.is_empty());
    assert_eq!(entry.calls, vec![0x52]);

    // the embedded filename is extracted and tied to its user
    assert_eq!(report.strings.get(&0x5D).map(String::as_str), Some("TITLE.PC8"));
    assert!(entry
        .comments
        .iter()
        .any(|c| c.contains("TITLE.PC8")));
}

#[test]
fn save_output_writes_report_files() {
    let image = synthetic_mz(&game_like_payload());
    let report = Decompiler::new(image, "game.exe", Options::default())
        .decompile()
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    save_output(&report, dir.path(), true).unwrap();

    for name in [
        "header.txt",
        "disassembly.asm",
        "strings.txt",
        "functions.json",
        "functions.csv",
        "call_graph.dot",
    ] {
        assert!(dir.path().join(name).is_file(), "{name} missing");
    }

    let asm = std::fs::read_to_string(dir.path().join("disassembly.asm")).unwrap();
    assert!(asm.contains("entry:"));
    assert!(asm.contains("sub_52:"));

    let dot = std::fs::read_to_string(dir.path().join("call_graph.dot")).unwrap();
    assert!(dot.contains("\"entry\" -> \"sub_52\";"));
}

#[rstest]
#[case(OutputFormat::Text)]
#[case(OutputFormat::Json)]
#[case(OutputFormat::Csv)]
#[case(OutputFormat::Dot)]
fn every_format_renders_the_report(#[case] format: OutputFormat) {
    let image = synthetic_mz(&game_like_payload());
    let report = Decompiler::new(image, "game.exe", Options::default())
        .decompile()
        .unwrap();
    let rendered = format.get_formatter().format(&report).unwrap();
    assert!(rendered.contains("entry"));
}

#[test]
fn garbage_input_is_rejected() {
    let report = Decompiler::new(b"not an exe".to_vec(), "junk", Options::default()).decompile();
    assert!(report.is_err());
}
