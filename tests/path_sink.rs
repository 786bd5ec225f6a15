//! Writing images into OCI image-layout directories, including the
//! two-phase encrypted write and the in-place blob unzip.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use flate2::read::GzDecoder;
use oci_client::manifest::{OciImageIndex, OciImageManifest};
use openssl::rsa::Rsa;
use sha2::{Digest, Sha256};

use kapsule::builder;
use kapsule::crypto::providers::{FileProvider, NullProvider};
use kapsule::image::{Image, Layer};
use kapsule::reader::RemoteLayer;
use kapsule::writer::encryption::decrypt_image;
use kapsule::writer::{ImageWriter, PathWriter};

const JWE_ANNOTATION: &str = "org.opencontainers.image.enc.keys.jwe";
const PUBOPTS_ANNOTATION: &str = "org.opencontainers.image.enc.pubopts";

const MODELFILE: &str = concat!(
    "FROM ./m.gguf\n",
    "TEMPLATE \"[INST] {{.P}} [/INST]\"\n",
    "PARAMETER stop [/INST]\n",
    "PARAMETER stop [INST]\n",
);

fn build_image(context: &Path) -> Image {
    std::fs::write(context.join("m.gguf"), b"blah").unwrap();
    std::fs::write(context.join("Modelfile"), MODELFILE).unwrap();
    builder::build(context.join("Modelfile"), context).unwrap()
}

fn write_key_pair(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let rsa = Rsa::generate(2048).unwrap();
    let public = dir.join("key.pub");
    let private = dir.join("key.pem");
    std::fs::write(&public, rsa.public_key_to_pem().unwrap()).unwrap();
    std::fs::write(&private, rsa.private_key_to_pem().unwrap()).unwrap();
    (public, private)
}

fn read_single_manifest(root: &Path) -> OciImageManifest {
    let index: OciImageIndex =
        serde_json::from_slice(&std::fs::read(root.join("index.json")).unwrap()).unwrap();
    assert_eq!(index.manifests.len(), 1);
    let manifest_path = blob_path(root, &index.manifests[0].digest);
    serde_json::from_slice(&std::fs::read(manifest_path).unwrap()).unwrap()
}

fn blob_path(root: &Path, digest: &str) -> std::path::PathBuf {
    root.join("blobs/sha256")
        .join(digest.strip_prefix("sha256:").unwrap())
}

#[tokio::test]
async fn write_produces_a_complete_layout() {
    let context = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let image = build_image(context.path());

    let writer = PathWriter::new(output.path(), Arc::new(NullProvider));
    writer
        .write(image, "models/llama:7b", false, false)
        .await
        .unwrap();

    assert!(output.path().join("oci-layout").exists());

    let manifest = read_single_manifest(output.path());
    assert_eq!(manifest.layers.len(), 3);
    for descriptor in &manifest.layers {
        let blob = blob_path(output.path(), &descriptor.digest);
        assert!(blob.exists());
        assert_eq!(
            std::fs::metadata(&blob).unwrap().len() as i64,
            descriptor.size
        );
    }
    assert!(blob_path(output.path(), &manifest.config.digest).exists());
}

#[tokio::test]
async fn encrypted_write_rewrites_the_manifest_with_annotations() {
    let context = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let keys = tempfile::tempdir().unwrap();
    let image = build_image(context.path());
    let (public, private) = write_key_pair(keys.path());

    let writer = PathWriter::new(
        output.path(),
        Arc::new(FileProvider::new(Some(public), Some(private))),
    );
    writer
        .write_encrypted(image, "models/llama:7b")
        .await
        .unwrap();

    let manifest = read_single_manifest(output.path());
    assert_eq!(manifest.layers.len(), 3);
    for descriptor in &manifest.layers {
        assert!(descriptor.media_type.ends_with("+enc"));
        let annotations = descriptor.annotations.as_ref().expect("annotations");
        assert!(!annotations[JWE_ANNOTATION].is_empty());
        assert!(!annotations[PUBOPTS_ANNOTATION].is_empty());
        assert!(blob_path(output.path(), &descriptor.digest).exists());
    }
}

#[tokio::test]
async fn encrypted_layout_decrypts_back_to_the_source_content() {
    let context = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let keys = tempfile::tempdir().unwrap();
    let image = build_image(context.path());
    let (public, private) = write_key_pair(keys.path());

    let writer = PathWriter::new(
        output.path(),
        Arc::new(FileProvider::new(Some(public), Some(private.clone()))),
    );
    writer
        .write_encrypted(image, "models/llama:7b")
        .await
        .unwrap();

    // Reconstruct the image from the written layout, as a pull would.
    let manifest = read_single_manifest(output.path());
    let layers = manifest
        .layers
        .iter()
        .map(|descriptor| {
            let bytes = std::fs::read(blob_path(output.path(), &descriptor.digest)).unwrap();
            Arc::new(RemoteLayer::new(descriptor.clone(), bytes)) as Arc<dyn Layer>
        })
        .collect();
    let config = std::fs::read(blob_path(output.path(), &manifest.config.digest)).unwrap();
    let stored = Image::from_source(layers, manifest, config);

    let key_pem = std::fs::read(&private).unwrap();
    let decrypted = decrypt_image(&stored, &key_pem).unwrap();

    let mut wire = Vec::new();
    decrypted.layers()[0]
        .compressed()
        .unwrap()
        .read_to_end(&mut wire)
        .unwrap();
    let mut content = Vec::new();
    GzDecoder::new(&wire[..]).read_to_end(&mut content).unwrap();
    assert_eq!(content, b"blah");

    // The diff ID is the hash of the uncompressed content, not its gzip.
    assert_eq!(
        decrypted.layers()[0].diff_id().unwrap(),
        format!("sha256:{}", hex::encode(Sha256::digest(b"blah")))
    );
}

#[tokio::test]
async fn unzip_keeps_blob_names_while_inflating_contents() {
    let context = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let image = build_image(context.path());

    let writer = PathWriter::new(output.path(), Arc::new(NullProvider));
    writer
        .write(image, "models/llama:7b", false, true)
        .await
        .unwrap();

    let manifest = read_single_manifest(output.path());
    let model = &manifest.layers[0];

    // Addressed by the compressed digest, holding uncompressed bytes.
    let blob = blob_path(output.path(), &model.digest);
    assert!(blob.exists());
    assert_eq!(std::fs::read(&blob).unwrap(), b"blah");
}

#[tokio::test]
async fn writing_the_same_ref_twice_replaces_the_index_entry() {
    let context = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let writer = PathWriter::new(output.path(), Arc::new(NullProvider));
    writer
        .write(build_image(context.path()), "models/llama:7b", false, false)
        .await
        .unwrap();
    writer
        .write(build_image(context.path()), "models/llama:7b", false, false)
        .await
        .unwrap();

    let index: OciImageIndex =
        serde_json::from_slice(&std::fs::read(output.path().join("index.json")).unwrap()).unwrap();
    assert_eq!(index.manifests.len(), 1);
}
