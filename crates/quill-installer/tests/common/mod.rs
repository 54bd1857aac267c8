//! Shared helpers for installer integration tests
//!
//! Provides wiremock endpoint setup for the registry protocol and tarball
//! downloads, plus in-memory archive builders.

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use quill_core::RuntimeEnv;
use semver::Version;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Host version used by the test environment
pub const HOST_VERSION: &str = "0.0.5";

/// Build a runtime environment rooted in a test directory
///
/// The package manager is `echo` so dependency installs succeed without
/// touching the network.
pub fn test_env(root: &Path) -> RuntimeEnv {
    RuntimeEnv::with_root(root.to_path_buf(), Version::parse(HOST_VERSION).unwrap())
        .with_package_manager("echo")
}

/// Build a gzipped tarball with entries under a `package/` top-level folder,
/// matching the registry tarball layout
pub fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("package/{name}"), content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Build a zip archive from name/content pairs
pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Extension manifest content for a tarball
pub fn manifest_json(name: &str, version: &str, engine: &str) -> String {
    json!({
        "name": name,
        "version": version,
        "engines": { "quill": engine },
    })
    .to_string()
}

/// Extension manifest carrying runtime dependencies
pub fn manifest_json_with_deps(name: &str, version: &str, engine: &str) -> String {
    json!({
        "name": name,
        "version": version,
        "engines": { "quill": engine },
        "dependencies": { "lodash": "^4.17.0" },
    })
    .to_string()
}

/// Mount a registry metadata document for one package version
pub async fn mock_registry_package(
    server: &MockServer,
    name: &str,
    version: &str,
    engine: Option<&str>,
) {
    let mut version_entry = json!({
        "dist": { "tarball": format!("{}/{}-{}.tgz", server.uri(), name, version) },
    });
    if let Some(engine) = engine {
        version_entry["engines"] = json!({ "quill": engine });
    }
    let doc = json!({
        "dist-tags": { "latest": version },
        "versions": { version: version_entry },
    });

    Mock::given(method("GET"))
        .and(path(format!("/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(doc))
        .mount(server)
        .await;
}

/// Mount a tarball download endpoint for one package version
pub async fn mock_tarball(server: &MockServer, name: &str, version: &str, bytes: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/{name}-{version}.tgz")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/gzip")
                .set_body_bytes(bytes),
        )
        .mount(server)
        .await;
}

/// Mount registry metadata and a matching tarball in one call
pub async fn mock_package(server: &MockServer, name: &str, version: &str, engine: &str) {
    mock_registry_package(server, name, version, Some(engine)).await;
    mock_tarball(
        server,
        name,
        version,
        tarball(&[("package.json", &manifest_json(name, version, engine))]),
    )
    .await;
}
