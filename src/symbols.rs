use std::collections::HashMap;

/// Event stage a symbol was delivered at. Mirrors the milter macro stage
/// command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolStage {
    Connect,
    Helo,
    Mail,
    Rcpt,
    Body,
}

impl SymbolStage {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(SymbolStage::Connect),
            b'H' => Some(SymbolStage::Helo),
            b'M' => Some(SymbolStage::Mail),
            b'R' => Some(SymbolStage::Rcpt),
            b'B' | b'E' | b'N' | b'L' | b'T' => Some(SymbolStage::Body),
            _ => None,
        }
    }
}

// Lookup scans stages in this fixed order; first match wins.
const STAGE_ORDER: [SymbolStage; 5] = [
    SymbolStage::Connect,
    SymbolStage::Helo,
    SymbolStage::Mail,
    SymbolStage::Rcpt,
    SymbolStage::Body,
];

/// Per-connection key/value store for MTA-supplied macros, scoped by the
/// event stage they arrived at.
#[derive(Debug, Default)]
pub struct SymbolTable {
    stages: HashMap<SymbolStage, HashMap<String, String>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_symbol(&mut self, stage: SymbolStage, key: &str, value: &str) {
        self.stages
            .entry(stage)
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Look a symbol up across all stages.
    pub fn get_symbol(&self, key: &str) -> Option<&str> {
        STAGE_ORDER
            .iter()
            .filter_map(|stage| self.stages.get(stage))
            .find_map(|map| map.get(key))
            .map(String::as_str)
    }

    /// Drop everything except connect-stage symbols. Called between
    /// messages so HELO/MAIL/RCPT macros do not leak into the next
    /// transaction.
    pub fn clear_symbols(&mut self) {
        self.stages.retain(|stage, _| *stage == SymbolStage::Connect);
    }

    pub fn clear_all_symbols(&mut self) {
        self.stages.clear();
    }
}
