//! Sequence objects and the parsers that produce them.

use super::{Args, CallError, CallResult, Output, WorkerObject};
use crate::model::{Metadata, SearchHit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bumped whenever the binary encoding of [`Sequence`] changes.
pub const BIN_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: Option<String>,
    pub seq: Vec<u8>,
    pub circular: bool,
}

#[derive(Serialize, Deserialize)]
struct BinSeq {
    version: u32,
    seq: Sequence,
}

fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'G' => b'C',
        b'C' => b'G',
        b'a' => b't',
        b't' => b'a',
        b'g' => b'c',
        b'c' => b'g',
        other => other,
    }
}

pub(crate) fn revcomp_bytes(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|&b| complement(b)).collect()
}

/// Positions where `needle` occurs in `haystack`, ignoring ASCII case.
pub(crate) fn find_all(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| window.eq_ignore_ascii_case(needle))
        .map(|(pos, _)| pos)
        .collect()
}

impl Sequence {
    pub fn new(name: impl Into<String>, seq: impl Into<Vec<u8>>) -> Self {
        Self {
            name: Some(name.into()),
            seq: seq.into(),
            circular: false,
        }
    }

    pub fn len(&self) -> usize {
        self.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seq.is_empty()
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            name: self.name.clone().unwrap_or_default(),
            len: self.len(),
            circular: self.circular,
        }
    }

    pub fn revcomp(&self) -> Sequence {
        Sequence {
            name: self.name.clone(),
            seq: revcomp_bytes(&self.seq),
            circular: self.circular,
        }
    }

    /// Bases in `start..end`. Wraps through the origin on circular sequences
    /// when `end < start`.
    pub fn extract_range(&self, start: usize, end: usize) -> CallResult<Sequence> {
        let len = self.len();
        if start > len || end > len {
            return Err(CallError::new(format!(
                "Range {}..{} outside sequence of length {}",
                start, end, len
            )));
        }
        let seq = if start <= end {
            self.seq[start..end].to_vec()
        } else if self.circular {
            let mut wrapped = self.seq[start..].to_vec();
            wrapped.extend_from_slice(&self.seq[..end]);
            wrapped
        } else {
            return Err(CallError::new(format!(
                "Range {}..{} wraps the origin of a linear sequence",
                start, end
            )));
        };
        Ok(Sequence {
            name: self.name.clone(),
            seq,
            circular: false,
        })
    }

    /// Rotate so that `origin` becomes position 0.
    pub fn set_origin(&self, origin: usize) -> CallResult<Sequence> {
        if origin > self.len() {
            return Err(CallError::new(format!(
                "Origin {} outside sequence of length {}",
                origin,
                self.len()
            )));
        }
        let mut seq = self.seq[origin..].to_vec();
        seq.extend_from_slice(&self.seq[..origin]);
        Ok(Sequence {
            name: self.name.clone(),
            seq,
            circular: true,
        })
    }

    /// Search both strands. Returns at most `max_res + 1` hits so the caller
    /// can tell that more were available.
    pub fn search(&self, query: &str, max_res: usize) -> Vec<SearchHit> {
        let query = query.trim().as_bytes();
        if query.is_empty() || self.is_empty() {
            return Vec::new();
        }

        let len = self.len();
        let mut haystack = self.seq.clone();
        if self.circular {
            let overlap = (query.len() - 1).min(len);
            haystack.extend_from_slice(&self.seq[..overlap]);
        }

        let rev_query = revcomp_bytes(query);
        let mut hits = Vec::new();
        for (needle, fwd) in [(query, true), (rev_query.as_slice(), false)] {
            for start in find_all(&haystack, needle) {
                if start >= len {
                    continue;
                }
                hits.push(SearchHit {
                    start,
                    end: start + needle.len(),
                    fwd,
                });
                if hits.len() > max_res {
                    return hits;
                }
            }
            // palindromic queries would report every hit twice
            if rev_query == query {
                break;
            }
        }
        hits
    }

    pub fn to_bin(&self) -> CallResult<Vec<u8>> {
        let bin = BinSeq {
            version: BIN_FORMAT_VERSION,
            seq: self.clone(),
        };
        serde_json::to_vec(&bin).map_err(|e| CallError::new(format!("Couldn't encode: {}", e)))
    }
}

/// Decode the versioned binary format written by [`Sequence::to_bin`].
pub fn parse_bin(data: &[u8]) -> CallResult<Sequence> {
    #[derive(Deserialize)]
    struct Header {
        version: u32,
    }

    let header: Header = serde_json::from_slice(data)
        .map_err(|e| CallError::new(format!("Decoding header failed: {}", e)))?;
    if header.version != BIN_FORMAT_VERSION {
        return Err(CallError::new(format!(
            "Can't decode version {} of binary sequence format",
            header.version
        )));
    }
    let bin: BinSeq = serde_json::from_slice(data)
        .map_err(|e| CallError::new(format!("Decoding failed: {}", e)))?;
    Ok(bin.seq)
}

/// Parse every record of a FASTA file.
pub fn parse_fasta(data: &[u8]) -> CallResult<Vec<Sequence>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| CallError::new(format!("Parsing failed: {}", e)))?;

    let mut records: Vec<Sequence> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.split_whitespace().next().unwrap_or_default();
            records.push(Sequence::new(name, Vec::new()));
            continue;
        }
        let record = records.last_mut().ok_or_else(|| {
            CallError::new(format!(
                "Parsing failed: sequence data before header on line {}",
                line_no + 1
            ))
        })?;
        if let Some(bad) = line
            .bytes()
            .find(|b| !(b.is_ascii_alphabetic() || *b == b'-' || *b == b'*'))
        {
            return Err(CallError::new(format!(
                "Invalid sequence: unexpected character '{}' on line {}",
                bad as char,
                line_no + 1
            )));
        }
        record.seq.extend_from_slice(line.as_bytes());
    }
    Ok(records)
}

fn derived(seq: Sequence) -> Output {
    Output::Object(WorkerObject::Seq(Arc::new(seq)))
}

/// Dispatch a method call on a `Seq`.
pub(super) fn call(seq: &Arc<Sequence>, method: &str, args: &mut Args) -> CallResult<Output> {
    match method {
        "get_metadata" => Output::value(seq.metadata()),
        "is_empty" => Output::value(seq.is_empty()),
        "set_name" => {
            let name: String = args.value(0)?;
            let mut renamed = Sequence::clone(seq);
            renamed.name = Some(name);
            Ok(derived(renamed))
        }
        "set_circular" => {
            let circular: bool = args.value(0)?;
            let mut changed = Sequence::clone(seq);
            changed.circular = circular;
            Ok(derived(changed))
        }
        "revcomp" => Ok(derived(seq.revcomp())),
        "get_seq_slice" => {
            let start: usize = args.value(0)?;
            let end: usize = args.value(1)?;
            if start > end || end > seq.len() {
                return Output::value("");
            }
            Output::value(String::from_utf8_lossy(&seq.seq[start..end]))
        }
        "extract_range" => {
            let start: usize = args.value(0)?;
            let end: usize = args.value(1)?;
            let name: Option<String> = args.opt_value(2)?;
            let mut extracted = seq.extract_range(start, end)?;
            if name.is_some() {
                extracted.name = name;
            }
            Ok(derived(extracted))
        }
        "set_origin" => {
            let origin: usize = args.value(0)?;
            Ok(derived(seq.set_origin(origin)?))
        }
        "search_seq" => {
            let query: String = args.value(0)?;
            let max_res: usize = args.value(1)?;
            Output::value(seq.search(&query, max_res))
        }
        "to_bin" => Ok(Output::Binary(seq.to_bin()?)),
        // a new backing object sharing the immutable sequence data
        "clone" => Ok(Output::Object(WorkerObject::Seq(Arc::clone(seq)))),
        _ => Err(CallError::no_method("Seq", method)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fasta_records() {
        let seqs = parse_fasta(b">one first record\nACGT\nacgt\n\n>two\nGGCC\n").unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].name.as_deref(), Some("one"));
        assert_eq!(seqs[0].seq, b"ACGTacgt");
        assert_eq!(seqs[1].seq, b"GGCC");
    }

    #[test]
    fn test_parse_fasta_rejects_data_before_header() {
        let err = parse_fasta(b"ACGT\n>x\nAC\n").unwrap_err();
        assert!(err.to_string().contains("before header"));
    }

    #[test]
    fn test_parse_fasta_rejects_invalid_characters() {
        let err = parse_fasta(b">x\nAC1T\n").unwrap_err();
        assert!(err.to_string().contains("Invalid sequence"));
        assert!(err.to_string().contains("'1'"));
    }

    #[test]
    fn test_revcomp() {
        let seq = Sequence::new("s", b"AACGTt".to_vec());
        assert_eq!(seq.revcomp().seq, b"aACGTT");
    }

    #[test]
    fn test_extract_range_wraps_on_circular_only() {
        let mut seq = Sequence::new("s", b"AACCGGTT".to_vec());
        assert!(seq.extract_range(6, 2).is_err());
        seq.circular = true;
        assert_eq!(seq.extract_range(6, 2).unwrap().seq, b"TTAA");
        assert_eq!(seq.extract_range(2, 4).unwrap().seq, b"CC");
        assert!(seq.extract_range(2, 40).is_err());
    }

    #[test]
    fn test_set_origin_rotates_and_circularizes() {
        let seq = Sequence::new("s", b"AACCGGTT".to_vec());
        let rotated = seq.set_origin(2).unwrap();
        assert_eq!(rotated.seq, b"CCGGTTAA");
        assert!(rotated.circular);
    }

    #[test]
    fn test_search_both_strands() {
        let seq = Sequence::new("s", b"AAGGTTTTCCAA".to_vec());
        let hits = seq.search("GGT", 10);
        assert!(hits.contains(&SearchHit { start: 2, end: 5, fwd: true }));
        // ACC is the reverse complement of GGT
        let rev_hits = seq.search("ACC", 10);
        assert!(rev_hits.contains(&SearchHit { start: 2, end: 5, fwd: false }));
    }

    #[test]
    fn test_search_reports_one_extra_hit_when_truncated() {
        let seq = Sequence::new("s", b"ATATATATAT".to_vec());
        let hits = seq.search("AT", 2);
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_search_across_origin_of_circular_sequence() {
        let mut seq = Sequence::new("s", b"GTTTTTTA".to_vec());
        assert!(seq.search("AG", 5).is_empty());
        seq.circular = true;
        let hits = seq.search("AG", 5);
        assert_eq!(hits[0], SearchHit { start: 7, end: 9, fwd: true });
    }

    #[test]
    fn test_binary_format_version_check() {
        let seq = Sequence::new("plasmid", b"ACGT".to_vec());
        let bin = seq.to_bin().unwrap();
        assert_eq!(parse_bin(&bin).unwrap(), seq);

        let stale = br#"{"version":1,"seq":{"name":null,"seq":[],"circular":false}}"#;
        let err = parse_bin(stale).unwrap_err();
        assert!(err.to_string().contains("version 1"));
    }
}
