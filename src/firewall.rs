use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::{Error, Result};

/// Marks accepted out of the box. Values are deliberately outside the ranges
/// Cilium claims for itself (0x0200-0x0f00).
pub const MARK_TENANT_A: &str = "0x10";
pub const MARK_TENANT_B: &str = "0x20";
pub const DEFAULT_ALLOWED_MARKS: [&str; 2] = [MARK_TENANT_A, MARK_TENANT_B];

const TABLE_MANGLE: &str = "mangle";
const CHAIN_PREROUTING: &str = "PREROUTING";

pub fn normalize_mark(mark: &str) -> String {
    mark.trim().to_ascii_lowercase()
}

/// The host rule table. An external capability so the manager can be driven
/// against an in-memory table in tests.
pub trait RuleTable {
    fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool>;
    fn append(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()>;
    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()>;
}

/// Drives the system `iptables` binary. Requires CAP_NET_ADMIN.
pub struct IptablesExec {
    binary: PathBuf,
}

impl Default for IptablesExec {
    fn default() -> Self {
        Self {
            binary: "iptables".into(),
        }
    }
}

impl IptablesExec {
    fn run(&self, table: &str, action: &str, chain: &str, rulespec: &[String]) -> Result<std::process::Output> {
        let output = Command::new(&self.binary)
            .arg("-t")
            .arg(table)
            .arg(action)
            .arg(chain)
            .args(rulespec)
            .output()?;
        debug!(binary = %self.binary.display(), table, action, chain, status = ?output.status, "ran rule table command");
        Ok(output)
    }
}

impl RuleTable for IptablesExec {
    fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<bool> {
        let output = self.run(table, "-C", chain, rulespec)?;
        if output.status.success() {
            return Ok(true);
        }
        // iptables -C exits 1 when the rule is absent
        if output.status.code() == Some(1) {
            return Ok(false);
        }
        Err(Error::RuleTable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    fn append(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()> {
        let output = self.run(table, "-A", chain, rulespec)?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::RuleTable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }

    fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> Result<()> {
        let output = self.run(table, "-D", chain, rulespec)?;
        if output.status.success() {
            return Ok(());
        }
        Err(Error::RuleTable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Idempotent add/delete/exists for the single mark rule of one pod address:
/// `-t mangle PREROUTING -s <addr> -j MARK --set-mark <mark>`.
pub struct MarkRuleManager<T> {
    table: T,
    allowed: Vec<String>,
}

impl<T: RuleTable> MarkRuleManager<T> {
    pub fn new(table: T, allowed: Vec<String>) -> Self {
        Self { table, allowed }
    }

    /// Rejects anything that is not a parseable address or an allow-listed
    /// mark before the rule tool is touched. The parsed address, not the
    /// caller's string, is what ends up in the rulespec.
    fn validate(&self, address: &str, mark: &str) -> Result<(IpAddr, String)> {
        let ip: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| Error::InvalidAddress(address.to_string()))?;
        let mark = normalize_mark(mark);
        if !self.allowed.iter().any(|m| *m == mark) {
            return Err(Error::MarkNotAllowed(mark));
        }
        Ok((ip, mark))
    }

    fn rulespec(ip: IpAddr, mark: &str) -> Vec<String> {
        vec![
            "-s".into(),
            ip.to_string(),
            "-j".into(),
            "MARK".into(),
            "--set-mark".into(),
            mark.into(),
        ]
    }

    pub fn add_rule(&self, address: &str, mark: &str) -> Result<()> {
        let (ip, mark) = self.validate(address, mark)?;
        let rule = Self::rulespec(ip, &mark);
        if self.table.exists(TABLE_MANGLE, CHAIN_PREROUTING, &rule)? {
            return Ok(());
        }
        self.table.append(TABLE_MANGLE, CHAIN_PREROUTING, &rule)
    }

    pub fn delete_rule(&self, address: &str, mark: &str) -> Result<()> {
        let (ip, mark) = self.validate(address, mark)?;
        let rule = Self::rulespec(ip, &mark);
        if !self.table.exists(TABLE_MANGLE, CHAIN_PREROUTING, &rule)? {
            return Ok(());
        }
        self.table.delete(TABLE_MANGLE, CHAIN_PREROUTING, &rule)
    }

    pub fn rule_exists(&self, address: &str, mark: &str) -> Result<bool> {
        let (ip, mark) = self.validate(address, mark)?;
        let rule = Self::rulespec(ip, &mark);
        self.table.exists(TABLE_MANGLE, CHAIN_PREROUTING, &rule)
    }
}
