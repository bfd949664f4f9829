use pretty_assertions::assert_eq;

use super::{compress, decompress, is_compressible, negotiate, Compressor, NOOP_COMPRESSOR_ID};
use crate::error::ErrorKind;

const BODY: &[u8] = b"\x00\x00\x00\x00\x00section bytes, repeated, repeated, repeated, repeated";

#[allow(dead_code)]
fn assert_reversible(compressor: Compressor) {
    let compressed = compress(&compressor, BODY).unwrap();
    assert_eq!(
        decompress(compressor.id(), &compressed, BODY.len()).unwrap(),
        BODY.to_vec()
    );

    let error = decompress(compressor.id(), &compressed, BODY.len() - 1).unwrap_err();
    assert!(
        matches!(*error.kind, ErrorKind::InvalidResponse { .. }),
        "{error:?}"
    );
}

#[cfg(feature = "zlib-compression")]
#[test]
fn zlib_bodies_come_back_unchanged() {
    assert_reversible(Compressor::Zlib { level: Some(4) });
    assert_reversible(Compressor::Zlib { level: None });
}

#[cfg(feature = "zstd-compression")]
#[test]
fn zstd_bodies_come_back_unchanged() {
    assert_reversible(Compressor::Zstd { level: None });
}

#[cfg(feature = "snappy-compression")]
#[test]
fn snappy_bodies_come_back_unchanged() {
    assert_reversible(Compressor::Snappy);
}

#[test]
fn noop_compressor_passes_bytes_through() {
    assert_eq!(
        decompress(NOOP_COMPRESSOR_ID, b"abc", 3).unwrap(),
        b"abc".to_vec()
    );
    assert!(decompress(NOOP_COMPRESSOR_ID, b"abc", 4).is_err());
}

#[test]
fn unknown_compressor_ids_are_rejected() {
    let error = decompress(42, b"abc", 3).unwrap_err();
    assert!(
        error.to_string().contains("unsupported compressor id 42"),
        "{error}"
    );
}

#[cfg(feature = "zlib-compression")]
#[test]
fn corrupt_zlib_payloads_are_rejected() {
    let error = decompress(super::ZLIB_COMPRESSOR_ID, b"definitely not zlib", 19).unwrap_err();
    assert!(
        error.to_string().contains("could not decompress server reply"),
        "{error}"
    );
}

#[test]
fn auth_commands_are_never_compressed() {
    for name in ["hello", "isMaster", "saslStart", "saslContinue", "createUser", "copydb"] {
        assert!(!is_compressible(name), "{name}");
    }
    assert!(is_compressible("find"));
    assert!(is_compressible("ping"));
}

#[cfg(feature = "zlib-compression")]
#[test]
fn negotiation_follows_client_preference() {
    let client = vec![Compressor::Zlib { level: None }];
    let server = vec!["snappy".to_string(), "zlib".to_string()];
    assert_eq!(
        negotiate(&client, Some(&server)),
        Some(Compressor::Zlib { level: None })
    );
    assert_eq!(negotiate(&client, Some(&["snappy".to_string()])), None);
    assert_eq!(negotiate(&client, None), None);
}

#[cfg(feature = "zlib-compression")]
#[test]
fn zlib_names_and_levels() {
    let compressor: Compressor = "ZLIB".parse().unwrap();
    assert_eq!(compressor, Compressor::Zlib { level: None });
    assert_eq!(
        compressor.clone().with_zlib_level(6),
        Compressor::Zlib { level: Some(6) }
    );
    assert_eq!(
        compressor.with_zlib_level(-1),
        Compressor::Zlib { level: None }
    );
    assert_eq!(
        Compressor::Zlib { level: Some(2) }.with_zlib_level(6),
        Compressor::Zlib { level: Some(2) }
    );

    assert!(Compressor::Zlib { level: Some(10) }.validate().is_err());
    assert!("lz4".parse::<Compressor>().is_err());
}
