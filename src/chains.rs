//! Protein chain sequences read from the project structure.

use std::collections::BTreeMap;

use camino::Utf8Path;
use tracing::warn;

use crate::error::IngestError;

/// Name given to atoms whose chain identifier column is blank.
pub const UNNAMED_CHAIN: char = '_';

/// One distinct sequence and every chain that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSequence {
    /// Chain identifiers joined with `", "`, e.g. `"A, B"`.
    pub key: String,
    pub sequence: String,
}

impl ChainSequence {
    pub fn chain_names(&self) -> Vec<&str> {
        split_chain_key(&self.key)
    }
}

pub fn split_chain_key(key: &str) -> Vec<&str> {
    key.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

pub async fn read_structure(path: &Utf8Path) -> Result<Vec<ChainSequence>, IngestError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            IngestError::MissingFile(path.to_path_buf())
        } else {
            IngestError::Filesystem(format!("{path}: {err}"))
        }
    })?;
    Ok(parse_structure(&content))
}

/// Collects residues from `ATOM` records of the first model, chain by chain.
/// Chains with identical sequences are reported once, keyed by all their names.
pub fn parse_structure(content: &str) -> Vec<ChainSequence> {
    let mut chains: Vec<(char, String)> = Vec::new();
    let mut last_residue: Option<(char, &str)> = None;
    let mut unnamed = false;

    for line in content.lines() {
        if line.starts_with("ENDMDL") {
            break;
        }
        if !line.starts_with("ATOM") || line.len() < 27 || !line.is_ascii() {
            continue;
        }
        let chain = match line[21..22].chars().next() {
            Some(' ') | None => {
                unnamed = true;
                UNNAMED_CHAIN
            }
            Some(chain) => chain,
        };
        let residue_id = &line[22..27];
        if last_residue == Some((chain, residue_id)) {
            continue;
        }
        last_residue = Some((chain, residue_id));

        let code = residue_code(line[17..20].trim());
        match chains.iter_mut().find(|(name, _)| *name == chain) {
            Some((_, sequence)) => sequence.push(code),
            None => chains.push((chain, code.to_string())),
        }
    }

    if unnamed {
        warn!(chain = %UNNAMED_CHAIN, "structure has atoms without a chain identifier");
    }

    let mut by_sequence: BTreeMap<String, Vec<char>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for (chain, sequence) in chains {
        let names = by_sequence.entry(sequence.clone()).or_default();
        if names.is_empty() {
            order.push(sequence);
        }
        names.push(chain);
    }

    order
        .into_iter()
        .filter(|sequence| sequence.chars().any(|code| code != 'X'))
        .filter_map(|sequence| {
            let names = by_sequence.remove(&sequence)?;
            let key = names
                .iter()
                .map(|name| name.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            Some(ChainSequence { key, sequence })
        })
        .collect()
}

fn residue_code(name: &str) -> char {
    match name {
        "ALA" => 'A',
        "ARG" => 'R',
        "ASN" => 'N',
        "ASP" => 'D',
        "CYS" | "CYX" | "CYM" => 'C',
        "GLN" => 'Q',
        "GLU" => 'E',
        "GLY" => 'G',
        "HIS" | "HID" | "HIE" | "HIP" | "HSD" | "HSE" | "HSP" => 'H',
        "ILE" => 'I',
        "LEU" => 'L',
        "LYS" => 'K',
        "MET" => 'M',
        "PHE" => 'F',
        "PRO" => 'P',
        "SER" => 'S',
        "THR" => 'T',
        "TRP" => 'W',
        "TYR" => 'Y',
        "VAL" => 'V',
        "SEC" => 'U',
        "PYL" => 'O',
        _ => 'X',
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(serial: u32, name: &str, residue: &str, chain: char, number: u32) -> String {
        format!(
            "ATOM  {serial:>5} {name:<4} {residue:>3} {chain}{number:>4}    {x:>8.3}{y:>8.3}{z:>8.3}  1.00  0.00",
            x = 1.0,
            y = 2.0,
            z = 3.0
        )
    }

    #[test]
    fn groups_identical_chains() {
        let lines = [
            atom(1, "N", "MET", 'A', 1),
            atom(2, "CA", "MET", 'A', 1),
            atom(3, "N", "LYS", 'A', 2),
            atom(4, "N", "MET", 'B', 1),
            atom(5, "N", "LYS", 'B', 2),
            atom(6, "N", "GLY", 'C', 1),
            "HETATM    7  O   HOH W   1       0.000   0.000   0.000  1.00  0.00".to_string(),
        ];
        let chains = parse_structure(&lines.join("\n"));
        assert_eq!(
            chains,
            vec![
                ChainSequence {
                    key: "A, B".to_string(),
                    sequence: "MK".to_string()
                },
                ChainSequence {
                    key: "C".to_string(),
                    sequence: "G".to_string()
                },
            ]
        );
        assert_eq!(chains[0].chain_names(), vec!["A", "B"]);
    }

    #[test]
    fn unknown_residues_and_later_models() {
        let lines = [
            atom(1, "N", "UNK", 'A', 1),
            atom(2, "N", "ALA", 'A', 2),
            "ENDMDL".to_string(),
            atom(3, "N", "TRP", 'A', 3),
        ];
        let chains = parse_structure(&lines.join("\n"));
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].sequence, "XA");
    }

    #[test]
    fn blank_chain_identifier_gets_a_name() {
        let lines = [
            atom(1, "N", "MET", ' ', 1),
            atom(2, "N", "LYS", ' ', 2),
            atom(3, "N", "GLY", 'B', 1),
        ];
        let chains = parse_structure(&lines.join("\n"));
        assert_eq!(chains[0].key, "_");
        assert_eq!(chains[0].sequence, "MK");
        assert_eq!(chains[0].chain_names(), vec!["_"]);
        assert_eq!(chains[1].chain_names(), vec!["B"]);
    }
}
