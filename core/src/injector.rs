use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use zip::ZipArchive;

use crate::error::{CoreError, CoreResult};
use crate::task::Sinf;

const MISSING_PLISTS: &str = "Could not read manifest or info plist";

/// Append signature material and the optional metadata document into a
/// downloaded archive without rebuilding it. The archive is only ever read
/// through the zip crate; the append goes through the external `zip` tool.
pub fn inject(archive: &Path, sinfs: &[Sinf], itunes_metadata: Option<&str>) -> CoreResult<()> {
    let layout = read_layout(archive)?;

    let mut targets: Vec<(String, Vec<u8>)> = Vec::new();
    match layout {
        Some(layout) => {
            let manifest = layout.manifest.as_deref().and_then(parse_plist);
            let info = layout.info.as_deref().and_then(parse_plist);
            plan_sinf_targets(&layout.bundle, manifest.as_ref(), info.as_ref(), sinfs, &mut targets)?;
        }
        None if !sinfs.is_empty() => {
            return Err(CoreError::Inject(MISSING_PLISTS.to_string()));
        }
        None => {}
    }

    if let Some(encoded) = itunes_metadata {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|err| CoreError::Inject(format!("invalid metadata encoding: {err}")))?;
        targets.push(("iTunesMetadata.plist".to_string(), transcode_metadata(&raw)));
    }

    if targets.is_empty() {
        return Ok(());
    }
    append_entries(archive, &targets)
}

struct ArchiveLayout {
    bundle: String,
    manifest: Option<Vec<u8>>,
    info: Option<Vec<u8>>,
}

fn read_layout(archive: &Path) -> CoreResult<Option<ArchiveLayout>> {
    let file = File::open(archive).map_err(|err| CoreError::Io(err.to_string()))?;
    let mut zip =
        ZipArchive::new(file).map_err(|err| CoreError::Inject(err.to_string()))?;
    let names: Vec<String> = zip.file_names().map(str::to_string).collect();

    let Some(info_path) = find_info_entry(&names) else {
        return Ok(None);
    };
    let Some(bundle) = bundle_name(&info_path) else {
        return Ok(None);
    };

    let manifest_path = format!("Payload/{bundle}.app/SC_Info/Manifest.plist");
    let manifest = read_entry(&mut zip, &manifest_path);
    let info = read_entry(&mut zip, &info_path);
    Ok(Some(ArchiveLayout {
        bundle,
        manifest,
        info,
    }))
}

/// First bundle descriptor entry, skipping companion watch bundles.
fn find_info_entry(names: &[String]) -> Option<String> {
    names
        .iter()
        .find(|name| name.contains(".app/Info.plist") && !name.contains("/Watch/"))
        .cloned()
}

fn bundle_name(entry_path: &str) -> Option<String> {
    entry_path
        .split('/')
        .find(|component| component.ends_with(".app"))
        .map(|component| component.trim_end_matches(".app").to_string())
}

fn read_entry(zip: &mut ZipArchive<File>, name: &str) -> Option<Vec<u8>> {
    let mut entry = zip.by_name(name).ok()?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf).ok()?;
    Some(buf)
}

fn plan_sinf_targets(
    bundle: &str,
    manifest: Option<&plist::Value>,
    info: Option<&plist::Value>,
    sinfs: &[Sinf],
    targets: &mut Vec<(String, Vec<u8>)>,
) -> CoreResult<()> {
    let sinf_paths = manifest
        .and_then(plist::Value::as_dictionary)
        .and_then(|dict| dict.get("SinfPaths"))
        .and_then(plist::Value::as_array);

    if let Some(paths) = sinf_paths {
        for (index, value) in paths.iter().enumerate() {
            if index >= sinfs.len() {
                break;
            }
            let Some(rel) = value.as_string() else {
                continue;
            };
            let data = decode_sinf(&sinfs[index])?;
            targets.push((format!("Payload/{bundle}.app/{rel}"), data));
        }
        return Ok(());
    }

    let executable = info
        .and_then(plist::Value::as_dictionary)
        .and_then(|dict| dict.get("CFBundleExecutable"))
        .and_then(plist::Value::as_string);

    match executable {
        Some(executable) if !sinfs.is_empty() => {
            let data = decode_sinf(&sinfs[0])?;
            targets.push((
                format!("Payload/{bundle}.app/SC_Info/{executable}.sinf"),
                data,
            ));
            Ok(())
        }
        _ if sinfs.is_empty() => Ok(()),
        _ => Err(CoreError::Inject(MISSING_PLISTS.to_string())),
    }
}

fn decode_sinf(sinf: &Sinf) -> CoreResult<Vec<u8>> {
    BASE64
        .decode(sinf.sinf.trim())
        .map_err(|err| CoreError::Inject(format!("invalid signature encoding: {err}")))
}

/// Binary property list first; XML only when the bytes plausibly are one.
fn parse_plist(bytes: &[u8]) -> Option<plist::Value> {
    match plist::Value::from_reader(Cursor::new(bytes)) {
        Ok(value) => Some(value),
        Err(_) if looks_like_xml(bytes) => {
            plist::Value::from_reader_xml(Cursor::new(bytes)).ok()
        }
        Err(_) => None,
    }
}

fn looks_like_xml(bytes: &[u8]) -> bool {
    contains_subslice(bytes, b"<?xml") || contains_subslice(bytes, b"<plist")
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Re-encode the XML metadata document as a canonical binary property list;
/// undecodable input passes through untouched.
fn transcode_metadata(raw: &[u8]) -> Vec<u8> {
    let Ok(value) = plist::Value::from_reader_xml(Cursor::new(raw)) else {
        return raw.to_vec();
    };
    let mut out = Vec::new();
    match value.to_writer_binary(&mut out) {
        Ok(()) => out,
        Err(_) => raw.to_vec(),
    }
}

/// Stage the targets under a throwaway directory mirroring their archive
/// paths, then ask the external tool to append them with no compression.
fn append_entries(archive: &Path, targets: &[(String, Vec<u8>)]) -> CoreResult<()> {
    let archive = archive
        .canonicalize()
        .map_err(|err| CoreError::Io(err.to_string()))?;
    let staging = tempfile::tempdir().map_err(|err| CoreError::Io(err.to_string()))?;
    let root = staging
        .path()
        .canonicalize()
        .map_err(|err| CoreError::Io(err.to_string()))?;

    let mut entry_names: Vec<String> = Vec::with_capacity(targets.len());
    for (name, data) in targets {
        let rel = safe_relative(name)?;
        let full = root.join(&rel);
        // Manifest-supplied paths are untrusted; nothing may escape staging.
        if !full.starts_with(&root) {
            return Err(CoreError::Inject(format!("unsafe archive path {name}")));
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|err| CoreError::Io(err.to_string()))?;
        }
        fs::write(&full, data).map_err(|err| CoreError::Io(err.to_string()))?;
        entry_names.push(rel.to_string_lossy().to_string());
    }

    let output = Command::new("zip")
        .arg("-0")
        .arg(&archive)
        .arg("--")
        .args(&entry_names)
        .current_dir(&root)
        .output()
        .map_err(|err| CoreError::Inject(format!("failed to run zip: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CoreError::Inject(format!(
            "zip exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

fn safe_relative(value: &str) -> CoreResult<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(value).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CoreError::Inject(format!("unsafe archive path {value}")));
            }
        }
    }
    if rel.as_os_str().is_empty() {
        return Err(CoreError::Inject(format!("unsafe archive path {value}")));
    }
    Ok(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    const METADATA_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>itemName</key>
    <string>Example</string>
    <key>itemId</key>
    <integer>42</integer>
</dict>
</plist>
"#;

    fn zip_tool_available() -> bool {
        Command::new("zip").arg("-v").output().is_ok()
    }

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn manifest_with_paths(paths: &[&str]) -> Vec<u8> {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "SinfPaths".to_string(),
            plist::Value::Array(
                paths
                    .iter()
                    .map(|p| plist::Value::String(p.to_string()))
                    .collect(),
            ),
        );
        let mut out = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_binary(&mut out)
            .unwrap();
        out
    }

    fn info_with_executable(name: &str) -> Vec<u8> {
        let mut dict = plist::Dictionary::new();
        dict.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String(name.to_string()),
        );
        let mut out = Vec::new();
        plist::Value::Dictionary(dict)
            .to_writer_binary(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn bundle_discovery_skips_watch_bundles() {
        let names = vec![
            "Payload/X.app/Watch/Y.app/Info.plist".to_string(),
            "Payload/X.app/Info.plist".to_string(),
        ];
        // The watch entry contains "/Watch/" and is excluded even though it
        // comes first.
        assert_eq!(
            find_info_entry(&names[1..]).as_deref(),
            Some("Payload/X.app/Info.plist")
        );
        let first = find_info_entry(&names).unwrap();
        assert_eq!(first, "Payload/X.app/Info.plist");
        assert_eq!(bundle_name(&first).unwrap(), "X");
    }

    #[test]
    fn plist_parsing_prefers_binary_and_gates_xml() {
        let binary = info_with_executable("X");
        assert!(parse_plist(&binary).is_some());
        assert!(parse_plist(METADATA_XML.as_bytes()).is_some());
        // Arbitrary bytes without XML markers parse as nothing.
        assert!(parse_plist(b"definitely not a plist").is_none());
    }

    #[test]
    fn metadata_transcode_round_trips() {
        let binary = transcode_metadata(METADATA_XML.as_bytes());
        assert!(binary.starts_with(b"bplist"));
        let reparsed = plist::Value::from_reader(Cursor::new(&binary)).unwrap();
        let original = plist::Value::from_reader_xml(Cursor::new(METADATA_XML.as_bytes())).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn metadata_transcode_passes_garbage_through() {
        let raw = b"not a plist at all";
        assert_eq!(transcode_metadata(raw), raw.to_vec());
    }

    #[test]
    fn adversarial_paths_are_rejected() {
        assert!(safe_relative("Payload/X.app/SC_Info/X.sinf").is_ok());
        assert!(safe_relative("../escape").is_err());
        assert!(safe_relative("/etc/passwd").is_err());
        assert!(safe_relative("a/../../b").is_err());
        assert!(safe_relative("").is_err());
    }

    #[test]
    fn inject_writes_sinf_and_metadata() {
        if !zip_tool_available() {
            eprintln!("zip tool not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.ipa");
        let manifest = manifest_with_paths(&["SC_Info/X.sinf"]);
        write_archive(
            &archive,
            &[
                ("Payload/X.app/Info.plist", &info_with_executable("X")),
                ("Payload/X.app/SC_Info/Manifest.plist", &manifest),
                ("Payload/X.app/binary", b"code"),
            ],
        );

        let sinf_bytes = b"signature-material".to_vec();
        let sinfs = vec![Sinf {
            id: 0,
            sinf: BASE64.encode(&sinf_bytes),
        }];
        let metadata = BASE64.encode(METADATA_XML.as_bytes());
        inject(&archive, &sinfs, Some(&metadata)).unwrap();

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut stored = Vec::new();
        zip.by_name("Payload/X.app/SC_Info/X.sinf")
            .unwrap()
            .read_to_end(&mut stored)
            .unwrap();
        assert_eq!(stored, sinf_bytes);

        let mut meta = Vec::new();
        zip.by_name("iTunesMetadata.plist")
            .unwrap()
            .read_to_end(&mut meta)
            .unwrap();
        let value = plist::Value::from_reader(Cursor::new(&meta)).unwrap();
        let expected =
            plist::Value::from_reader_xml(Cursor::new(METADATA_XML.as_bytes())).unwrap();
        assert_eq!(value, expected);
    }

    #[test]
    fn inject_falls_back_to_info_executable() {
        if !zip_tool_available() {
            eprintln!("zip tool not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.ipa");
        write_archive(
            &archive,
            &[("Payload/X.app/Info.plist", &info_with_executable("XBin"))],
        );
        let sinfs = vec![Sinf {
            id: 0,
            sinf: BASE64.encode(b"sig"),
        }];
        inject(&archive, &sinfs, None).unwrap();

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        assert!(zip.by_name("Payload/X.app/SC_Info/XBin.sinf").is_ok());
    }

    #[test]
    fn inject_without_plists_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("app.ipa");
        write_archive(&archive, &[("README.txt", b"no payload here")]);
        let sinfs = vec![Sinf {
            id: 0,
            sinf: BASE64.encode(b"sig"),
        }];
        let err = inject(&archive, &sinfs, None).unwrap_err();
        assert!(err.to_string().contains(MISSING_PLISTS));
    }
}
