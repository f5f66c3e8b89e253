use std::path::Path;

/// Whether `path` looks like a front-end IR listing.
pub fn is_ir_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[test]
fn ir_files_are_recognised_by_extension() {
  let cases = [
    ("app.units.json", true),
    ("APP.JSON",       true),
    ("App.java",       false),
    ("units.json.bak", false),
    ("json",           false),
  ];

  for (file, expected) in cases {
    assert_eq!(is_ir_file(Path::new(file)), expected, "case: {file}");
  }
}
