use std::collections::HashSet;
use std::fs;
use std::path::Path;
use anyhow::Result;
use tracing::{info, warn};

use crate::models::TrackedAccount;

/// Static list of tracked accounts, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    accounts: Vec<TrackedAccount>,
    ids: HashSet<u64>,
}

impl Roster {
    pub fn new(accounts: Vec<TrackedAccount>) -> Self {
        let ids = accounts.iter().filter_map(|a| a.id).collect();
        Roster { accounts, ids }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Roster not found at {:?}", path));
        }
        let contents = fs::read_to_string(path)?;
        let roster = Self::parse(&contents)?;
        info!(path = %path.display(), accounts = roster.len(), "Loaded roster");
        Ok(roster)
    }

    /// Parse a `;`-separated table with a header naming `id` and/or `screen_name`.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| anyhow::anyhow!("Roster is empty"))?;
        let columns: Vec<String> = header
            .trim_start_matches('\u{feff}')
            .split(';')
            .map(|c| c.trim().trim_matches('"').to_lowercase())
            .collect();
        let id_col = columns.iter().position(|c| c == "id");
        let handle_col = columns.iter().position(|c| c == "screen_name");
        if id_col.is_none() && handle_col.is_none() {
            return Err(anyhow::anyhow!(
                "Roster header must contain an 'id' or 'screen_name' column"
            ));
        }

        let mut accounts = Vec::new();
        for (row, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(';').map(|c| c.trim().trim_matches('"')).collect();
            let cell = |col: Option<usize>| {
                col.and_then(|i| cells.get(i))
                    .copied()
                    .filter(|c| !c.is_empty())
            };

            let id = match cell(id_col) {
                Some(raw) => match parse_id(raw) {
                    Some(id) => Some(id),
                    None => {
                        warn!(row, value = raw, "Skipping unparseable roster id");
                        None
                    }
                },
                None => None,
            };
            let handle = cell(handle_col).map(str::to_string);

            if id.is_none() && handle.is_none() {
                continue;
            }
            accounts.push(TrackedAccount { id, handle });
        }

        Ok(Self::new(accounts))
    }

    pub fn accounts(&self) -> &[TrackedAccount] {
        &self.accounts
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.accounts.iter().filter_map(|a| a.id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

// Spreadsheet exports sometimes write ids as floats ("12345.0").
fn parse_id(raw: &str) -> Option<u64> {
    raw.parse::<u64>()
        .ok()
        .or_else(|| raw.strip_suffix(".0").and_then(|s| s.parse().ok()))
}
