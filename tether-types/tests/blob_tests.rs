use proptest::prelude::*;
use tether_types::{BlobPath, EntityId, Error, FileRef, ImageFormat, TableId};

// ── BlobPath ──────────────────────────────────────────────────────

#[test]
fn key_joins_bucket_and_file_name() {
    let path = BlobPath::new(TableId::avatars(), "me.jpg");
    assert_eq!(path.key(), "avatars/me.jpg");
    assert_eq!(path.to_string(), "avatars/me.jpg");
}

#[test]
fn parse_keeps_nested_slashes_in_file_name() {
    let path = BlobPath::parse("files/2024/05/doc.pdf").unwrap();
    assert_eq!(path.bucket, TableId::new("files"));
    assert_eq!(path.file_name, "2024/05/doc.pdf");
}

#[test]
fn parse_rejects_single_segment() {
    assert!(matches!(
        BlobPath::parse("avatars"),
        Err(Error::InvalidBlobKey(_))
    ));
    assert!(BlobPath::parse("").is_err());
}

#[test]
fn profile_photo_path_uses_user_id_and_extension() {
    let id = EntityId::new();
    let path = BlobPath::profile_photo(TableId::avatars(), id, ImageFormat::Png);
    assert_eq!(path.key(), format!("avatars/{id}.png"));
}

// ── ImageFormat ───────────────────────────────────────────────────

#[test]
fn image_format_content_types() {
    assert_eq!(ImageFormat::default(), ImageFormat::Jpg);
    assert_eq!(ImageFormat::Jpg.content_type(), "image/jpg");
    assert_eq!(ImageFormat::Png.extension(), "png");
}

// ── FileRef ───────────────────────────────────────────────────────

#[test]
fn file_ref_distinguishes_urls_and_blob_keys() {
    assert_eq!(
        FileRef::parse("https://cdn.example.com/a.jpg").unwrap(),
        FileRef::Url("https://cdn.example.com/a.jpg".into())
    );
    assert_eq!(
        FileRef::parse("avatars/a.jpg").unwrap(),
        FileRef::Blob(BlobPath::new(TableId::avatars(), "a.jpg"))
    );
    assert!(FileRef::parse("loose-name").is_err());
}

#[test]
fn file_ref_key_matches_source_string() {
    assert_eq!(FileRef::parse("avatars/a.jpg").unwrap().key(), "avatars/a.jpg");
}

proptest! {
    #[test]
    fn key_parse_roundtrip(bucket in "[a-z]{1,8}", name in "[a-z0-9/._-]{0,20}") {
        let path = BlobPath::new(TableId::new(bucket), name);
        prop_assert_eq!(BlobPath::parse(&path.key()).unwrap(), path);
    }
}
