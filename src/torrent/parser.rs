//! Torrent file parser
//!
//! Decodes v1 `.torrent` files into [`TorrentInfo`]. The info hash is the SHA1
//! of the re-encoded `info` dictionary.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info};

use crate::error::TorrentError;
use crate::torrent::info::TorrentInfo;

type Dict = HashMap<Vec<u8>, Value>;

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        debug!("Parsing torrent file from {} bytes", data.len());

        let root = match serde_bencode::from_bytes::<Value>(data).map_err(TorrentError::from)? {
            Value::Dict(dict) => dict,
            _ => return Err(TorrentError::parse_error("Root must be a dictionary").into()),
        };

        let info_value = root
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_bytes = serde_bencode::to_bytes(info_value).map_err(TorrentError::from)?;
        let info_hash = TorrentInfo::generate_info_hash(&info_bytes);

        let info_dict = match info_value {
            Value::Dict(dict) => dict,
            _ => return Err(TorrentError::parse_error("Info must be a dictionary").into()),
        };

        let name = get_string(info_dict, "name")?;
        let piece_length = get_int(info_dict, "piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or_else(|| TorrentError::parse_error_with_source("Invalid piece length", piece_length.to_string()))?;
        let piece_hashes = TorrentInfo::parse_piece_hashes(get_bytes(info_dict, "pieces")?)?;

        let files = if let Some(Value::List(entries)) = info_dict.get(b"files".as_slice()) {
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let Value::Dict(file_dict) = entry else {
                    return Err(TorrentError::parse_error("File entry must be a dictionary").into());
                };
                let length = non_negative(get_int(file_dict, "length")?)?;
                let components = match file_dict.get(b"path".as_slice()) {
                    Some(Value::List(parts)) => parts,
                    _ => return Err(TorrentError::parse_error("Missing file path").into()),
                };
                let mut path = PathBuf::from(&name);
                for part in components {
                    let Value::Bytes(bytes) = part else {
                        return Err(TorrentError::parse_error("Path component must be a string").into());
                    };
                    path.push(String::from_utf8_lossy(bytes).as_ref());
                }
                files.push((path, length));
            }
            files
        } else {
            vec![(PathBuf::from(&name), non_negative(get_int(info_dict, "length")?)?)]
        };

        let mut torrent = TorrentInfo::new(info_hash, name, piece_length, piece_hashes, files);
        torrent.trackers = collect_trackers(&root);
        torrent.validate()?;

        info!(
            "Parsed torrent '{}' ({} bytes, {} pieces, info hash {})",
            torrent.name,
            torrent.total_length,
            torrent.piece_count(),
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source(format!("Failed to read {}", path.display()), e.to_string())
        })?;

        Self::parse_bytes(&data)
    }
}

fn get_bytes<'a>(dict: &'a Dict, key: &str) -> Result<&'a [u8]> {
    match dict.get(key.as_bytes()) {
        Some(Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(TorrentError::parse_error(format!("Missing or invalid '{}' field", key)).into()),
    }
}

fn get_string(dict: &Dict, key: &str) -> Result<String> {
    Ok(String::from_utf8_lossy(get_bytes(dict, key)?).into_owned())
}

fn get_int(dict: &Dict, key: &str) -> Result<i64> {
    match dict.get(key.as_bytes()) {
        Some(Value::Int(value)) => Ok(*value),
        _ => Err(TorrentError::parse_error(format!("Missing or invalid '{}' field", key)).into()),
    }
}

fn non_negative(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| TorrentError::parse_error_with_source("Negative length", value.to_string()).into())
}

fn collect_trackers(root: &Dict) -> Vec<String> {
    let mut trackers = Vec::new();
    if let Some(Value::Bytes(url)) = root.get(b"announce".as_slice()) {
        trackers.push(String::from_utf8_lossy(url).into_owned());
    }
    if let Some(Value::List(tiers)) = root.get(b"announce-list".as_slice()) {
        for tier in tiers {
            let Value::List(urls) = tier else { continue };
            for url in urls {
                if let Value::Bytes(bytes) = url {
                    let url = String::from_utf8_lossy(bytes).into_owned();
                    if !trackers.contains(&url) {
                        trackers.push(url);
                    }
                }
            }
        }
    }
    trackers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(entries.into_iter().map(|(k, v)| (k.as_bytes().to_vec(), v)).collect())
    }

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_single_file() {
        let info = dict(vec![
            ("name", bytes("file.bin")),
            ("piece length", Value::Int(32768)),
            ("pieces", Value::Bytes(vec![0xAB; 40])),
            ("length", Value::Int(50000)),
        ]);
        let torrent = dict(vec![("announce", bytes("http://tracker.test/announce")), ("info", info.clone())]);
        let data = serde_bencode::to_bytes(&torrent).unwrap();

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.name, "file.bin");
        assert_eq!(parsed.piece_length, 32768);
        assert_eq!(parsed.piece_count(), 2);
        assert_eq!(parsed.total_length, 50000);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.trackers, vec!["http://tracker.test/announce".to_string()]);

        let expected_hash = TorrentInfo::generate_info_hash(&serde_bencode::to_bytes(&info).unwrap());
        assert_eq!(parsed.info_hash, expected_hash);
    }

    #[test]
    fn test_parse_multi_file() {
        let files = Value::List(vec![
            dict(vec![("length", Value::Int(100)), ("path", Value::List(vec![bytes("a"), bytes("one.txt")]))]),
            dict(vec![("length", Value::Int(200)), ("path", Value::List(vec![bytes("two.txt")]))]),
        ]);
        let info = dict(vec![
            ("name", bytes("bundle")),
            ("piece length", Value::Int(256)),
            ("pieces", Value::Bytes(vec![1; 40])),
            ("files", files),
        ]);
        let data = serde_bencode::to_bytes(&dict(vec![("info", info)])).unwrap();

        let parsed = TorrentParser::parse_bytes(&data).unwrap();
        assert_eq!(parsed.total_length, 300);
        assert_eq!(parsed.files[0].path, PathBuf::from("bundle/a/one.txt"));
        assert_eq!(parsed.files[1].offset, 100);
        assert!(parsed.trackers.is_empty());
    }

    #[test]
    fn test_parse_rejects_inconsistent_piece_count() {
        let info = dict(vec![
            ("name", bytes("file.bin")),
            ("piece length", Value::Int(1024)),
            ("pieces", Value::Bytes(vec![0; 20])),
            ("length", Value::Int(5000)),
        ]);
        let data = serde_bencode::to_bytes(&dict(vec![("info", info)])).unwrap();
        assert!(TorrentParser::parse_bytes(&data).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_info() {
        let data = serde_bencode::to_bytes(&dict(vec![("announce", bytes("x"))])).unwrap();
        assert!(TorrentParser::parse_bytes(&data).is_err());
        assert!(TorrentParser::parse_bytes(b"not bencode").is_err());
    }
}
