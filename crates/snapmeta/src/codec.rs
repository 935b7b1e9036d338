// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Period-delimited token encoding of [`BackupMeta`]
//!
//! A key looks like:
//!
//! ```text
//! my_subvol.ctim2006-01-01T00:00:00+00:00.ctid12345.uuid<u>.sndp<u>.prnt<u>.mdvn1.seqn0
//! ```
//!
//! Token order is not significant for decoding. Tokens never contain a
//! period: timestamps are second-precision RFC 3339 with a numeric offset,
//! and UUIDs are canonical hyphenated hex. Unrecognized tokens (a leading
//! base name, trailing user suffixes like a compression extension) are
//! ignored by the parser.

use chrono::{DateTime, FixedOffset, SecondsFormat};
use uuid::Uuid;

use crate::{BackupMeta, MetaError, Result, METADATA_VERSION, SEQUENCE_NUMBER};

const CTIM: &str = "ctim";
const CTID: &str = "ctid";
const UUID: &str = "uuid";
const SNDP: &str = "sndp";
const PRNT: &str = "prnt";
const MDVN: &str = "mdvn";
const SEQN: &str = "seqn";

/// Encode metadata into a key with the given base name.
///
/// The ctime keeps whatever UTC offset it carries, formatted to second
/// precision, so encoding is stable byte for byte.
#[must_use]
pub fn encode(meta: &BackupMeta, base: &str) -> String {
    let ctime = meta.ctime.to_rfc3339_opts(SecondsFormat::Secs, false);
    format!(
        "{base}.{CTIM}{ctime}.{CTID}{ctransid}.{UUID}{uuid}.{SNDP}{sndp}.{PRNT}{prnt}.{MDVN}{METADATA_VERSION}.{SEQN}{SEQUENCE_NUMBER}",
        ctransid = meta.ctransid,
        uuid = meta.uuid,
        sndp = meta.send_parent_or_nil(),
        prnt = meta.parent_uuid,
    )
}

/// Decode a key previously produced by [`encode`].
///
/// Returns the base name (the tokens before the first metadata token) and
/// the decoded metadata. A zero send-parent UUID decodes to `None`.
///
/// # Errors
///
/// [`MetaError::MalformedKey`] when a required token is absent or its value
/// does not parse; [`MetaError::UnsupportedMetadataVersion`] and
/// [`MetaError::UnsupportedSequence`] when the key was written by an
/// incompatible producer.
pub fn decode(key: &str) -> Result<(String, BackupMeta)> {
    let mut uuid: Option<Uuid> = None;
    let mut parent_uuid: Option<Uuid> = None;
    let mut send_parent: Option<Uuid> = None;
    let mut ctransid: Option<u64> = None;
    let mut ctime: Option<DateTime<FixedOffset>> = None;
    let mut version: Option<u16> = None;
    let mut sequence: Option<u32> = None;

    let mut base_tokens: Vec<&str> = Vec::new();
    let mut in_base = true;

    let malformed = |what: &str, tok: &str| MetaError::MalformedKey(format!("{what}: {tok}"));

    for token in key.split('.') {
        let (code, rest) = match (token.get(..4), token.get(4..)) {
            (Some(code), Some(rest)) => (code, rest),
            _ => {
                if in_base {
                    base_tokens.push(token);
                }
                continue;
            }
        };
        match code {
            CTIM => {
                ctime = Some(
                    DateTime::parse_from_rfc3339(rest)
                        .map_err(|_| malformed("bad timestamp", token))?,
                );
            }
            CTID => {
                ctransid = Some(rest.parse().map_err(|_| malformed("bad ctransid", token))?);
            }
            UUID => {
                uuid = Some(rest.parse().map_err(|_| malformed("bad uuid", token))?);
            }
            SNDP => {
                let u: Uuid = rest
                    .parse()
                    .map_err(|_| malformed("bad send-parent uuid", token))?;
                send_parent = Some(u);
            }
            PRNT => {
                parent_uuid = Some(rest.parse().map_err(|_| malformed("bad parent uuid", token))?);
            }
            MDVN => {
                version = Some(rest.parse().map_err(|_| malformed("bad version", token))?);
            }
            SEQN => {
                sequence = Some(rest.parse().map_err(|_| malformed("bad sequence", token))?);
            }
            _ => {
                if in_base {
                    base_tokens.push(token);
                }
                continue;
            }
        }
        in_base = false;
    }

    match version {
        None => return Err(MetaError::MalformedKey("metadata version missing".into())),
        Some(v) if v != METADATA_VERSION => {
            return Err(MetaError::UnsupportedMetadataVersion(v));
        }
        Some(_) => {}
    }
    match sequence {
        None => return Err(MetaError::MalformedKey("sequence number missing".into())),
        Some(s) if s != SEQUENCE_NUMBER => return Err(MetaError::UnsupportedSequence(s)),
        Some(_) => {}
    }

    let (Some(uuid), Some(parent_uuid), Some(send_parent), Some(ctransid), Some(ctime)) =
        (uuid, parent_uuid, send_parent, ctransid, ctime)
    else {
        return Err(MetaError::MalformedKey(
            "missing or incomplete backup metadata tokens".into(),
        ));
    };

    let meta = BackupMeta {
        uuid,
        parent_uuid,
        send_parent: (!send_parent.is_nil()).then_some(send_parent),
        ctransid,
        ctime,
    };
    Ok((base_tokens.join("."), meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_KEY: &str = "my_subvol.ctim2006-01-01T00:00:00+00:00.ctid12345.\
                               uuid3fd11d8e-8110-4cd0-b85c-bae3dda86a3d.\
                               sndp00000000-0000-0000-0000-000000000000.\
                               prnt9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e.mdvn1.seqn0";

    fn example_meta() -> BackupMeta {
        BackupMeta {
            uuid: "3fd11d8e-8110-4cd0-b85c-bae3dda86a3d".parse().unwrap(),
            parent_uuid: "9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e".parse().unwrap(),
            send_parent: None,
            ctransid: 12345,
            ctime: DateTime::parse_from_rfc3339("2006-01-01T00:00:00+00:00").unwrap(),
        }
    }

    fn example_key() -> String {
        EXAMPLE_KEY.to_string()
    }

    #[test]
    fn encode_matches_reference_key() {
        assert_eq!(encode(&example_meta(), "my_subvol"), example_key());
    }

    #[test]
    fn decode_reference_key() {
        let (base, meta) = decode(&example_key()).unwrap();
        assert_eq!(base, "my_subvol");
        assert_eq!(meta, example_meta());
    }

    #[test]
    fn round_trip_differential_with_offset() {
        let meta = BackupMeta {
            send_parent: Some("9d9d3bcb-4b62-46a3-b6e2-678eeb24f54e".parse().unwrap()),
            ctime: DateTime::parse_from_rfc3339("2006-01-01T00:00:00-08:00").unwrap(),
            ..example_meta()
        };
        let key = encode(&meta, "data");
        let (base, decoded) = decode(&key).unwrap();
        assert_eq!(base, "data");
        assert_eq!(decoded, meta);
        assert!(key.contains("ctim2006-01-01T00:00:00-08:00"));
    }

    #[test]
    fn token_order_does_not_matter() {
        let mut tokens: Vec<&str> = example_key().leak().split('.').collect();
        tokens[1..].reverse();
        let (base, meta) = decode(&tokens.join(".")).unwrap();
        assert_eq!(base, "my_subvol");
        assert_eq!(meta, example_meta());
    }

    #[test]
    fn unknown_suffixes_are_ignored() {
        let key = format!("{}.gz.user-note", example_key());
        let (base, meta) = decode(&key).unwrap();
        assert_eq!(base, "my_subvol");
        assert_eq!(meta, example_meta());
    }

    #[test]
    fn base_containing_periods_round_trips() {
        let key = encode(&example_meta(), "my.dotted.name");
        let (base, _) = decode(&key).unwrap();
        assert_eq!(base, "my.dotted.name");
    }

    #[test]
    fn missing_token_is_malformed() {
        let key = example_key().replace(".ctid12345", "");
        assert!(matches!(decode(&key), Err(MetaError::MalformedKey(_))));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (from, to) in [
            ("ctid12345", "ctidtwelve"),
            ("ctim2006-01-01T00:00:00+00:00", "ctim2006-01-01"),
            (
                "uuid3fd11d8e-8110-4cd0-b85c-bae3dda86a3d",
                "uuidnot-a-uuid",
            ),
        ] {
            let key = example_key().replace(from, to);
            assert!(
                matches!(decode(&key), Err(MetaError::MalformedKey(_))),
                "{to} should be malformed"
            );
        }
    }

    #[test]
    fn unsupported_version_and_sequence() {
        let key = example_key().replace(".mdvn1", ".mdvn2");
        assert!(matches!(
            decode(&key),
            Err(MetaError::UnsupportedMetadataVersion(2))
        ));

        let key = example_key().replace(".seqn0", ".seqn7");
        assert!(matches!(decode(&key), Err(MetaError::UnsupportedSequence(7))));
    }

    #[test]
    fn not_a_backup_key_at_all() {
        assert!(matches!(
            decode("unrelated-object.tar.gz"),
            Err(MetaError::MalformedKey(_))
        ));
    }
}
