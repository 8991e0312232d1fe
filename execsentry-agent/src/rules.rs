//! Compiled-in rule catalog.
//!
//! Nothing here registers itself. The binary passes [`builtin`] to the
//! registry as an explicit startup step.

use execsentry_lib::models::{AlertSeverity, EventKind, RuleDefinition, ThreatTag};

/// Identifier of the log file deletion rule.
pub const LOG_FILES_DELETED: &str = "defense_evasion_log_files_deleted";

const LOG_FILE_PATTERNS: [&str; 9] = [
    "/var/run/utmp",
    "/var/log/wtmp",
    "/var/log/btmp",
    "/var/log/lastlog",
    "/var/log/faillog",
    "/var/log/syslog",
    "/var/log/messages",
    "/var/log/secure",
    "/var/log/auth.log",
];

/// All built-in rule definitions.
pub fn builtin() -> Vec<RuleDefinition> {
    vec![log_files_deleted()]
}

/// Deletion of login accounting and system log files.
pub fn log_files_deleted() -> RuleDefinition {
    RuleDefinition::new(
        LOG_FILES_DELETED,
        AlertSeverity::High,
        ["rm", "unlink", "shred"],
        LOG_FILE_PATTERNS,
    )
    .with_name("System Log File Deletion")
    .with_description(
        "Detects removal of system log and login accounting files, commonly done to hide \
         evidence of an intrusion.",
    )
    .with_event_kinds([EventKind::Exec])
    .with_threat(ThreatTag::mitre(
        "TA0005",
        "Defense Evasion",
        "T1070",
        "Indicator Removal on Host",
    ))
}
