use std::io::{Cursor, Write};
use std::path::Path;

use assert_cmd::Command;
use tempfile::TempDir;

fn leitor(data: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("leitor").unwrap();
    cmd.arg("--data-dir")
        .arg(data.path())
        .arg("--config")
        .arg(data.path().join("settings.toml"))
        .env("RUST_LOG", "off");
    cmd
}

fn write_comic(path: &Path) {
    let mut page = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image::RgbaImage::new(8, 12))
        .write_to(&mut page, image::ImageFormat::Png)
        .unwrap();
    let page = page.into_inner();

    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for name in ["01.png", "02.png"] {
        zip.start_file(name, zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(&page).unwrap();
    }
    std::fs::write(path, zip.finish().unwrap().into_inner()).unwrap();
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "{:?}", output);
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn empty_library_lists_nothing() {
    let data = TempDir::new().unwrap();
    leitor(&data)
        .arg("list")
        .assert()
        .success()
        .stdout("library is empty\n");
    leitor(&data)
        .args(["list", "--json"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn unsupported_files_are_rejected() {
    let data = TempDir::new().unwrap();
    let notes = data.path().join("notes.txt");
    std::fs::write(&notes, "hello").unwrap();
    let output = leitor(&data).arg("import").arg(&notes).output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("not supported"), "{stderr}");
}

#[test]
fn comic_round_trips_through_the_library() {
    let data = TempDir::new().unwrap();
    let comic = data.path().join("Vol 1.cbz");
    write_comic(&comic);

    let imported = stdout_of(leitor(&data).arg("import").arg(&comic));
    assert!(imported.contains("imported Vol 1 (comic-archive, 2 pages)"), "{imported}");

    let listing = stdout_of(leitor(&data).args(["list", "--json"]));
    let items: serde_json::Value = serde_json::from_str(&listing).unwrap();
    let item = &items[0];
    assert_eq!(item["title"], "Vol 1");
    assert_eq!(item["type"], "comic-archive");
    assert_eq!(item["pageCount"], 2);
    assert!(item["coverThumbnail"]
        .as_str()
        .unwrap()
        .starts_with("data:image/jpeg;base64,"));
    let id = item["id"].as_str().unwrap().to_owned();

    let duplicate = leitor(&data).arg("import").arg(&comic).output().unwrap();
    assert!(!duplicate.status.success());

    stdout_of(leitor(&data).args(["rename", &id, "First Volume"]));
    let listing = stdout_of(leitor(&data).arg("list"));
    assert!(listing.contains("First Volume"), "{listing}");

    stdout_of(leitor(&data).args(["remove", &id]));
    leitor(&data)
        .arg("list")
        .assert()
        .success()
        .stdout("library is empty\n");
    leitor(&data).args(["remove", &id]).assert().failure();
}
