pub mod eligibility;
pub mod init;
pub mod status;
pub mod take;
pub mod validate;

/// `mm:ss` rendering of a second count.
pub fn clock(secs: u64) -> String {
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
