//! Topic taxonomy.
//!
//! Broadcast topics sit directly under the `ntcb/` root. Daemon commands
//! share a single topic and are addressed by payload (`daemonSnowID`); bot
//! commands are addressed by topic (`ntcb/Bot/{snowID}`).

pub const ENTER: &str = "ntcb/Enter";
pub const EXIT: &str = "ntcb/Exit";
pub const TICKER: &str = "ntcb/Ticker";
pub const NOTICE: &str = "ntcb/Notice";
pub const LOG: &str = "ntcb/Log";
pub const STAT: &str = "ntcb/Stat";
pub const DAEMON: &str = "ntcb/Daemon";
pub const DAEMON_RECEIPT: &str = "ntcb/Daemon/Receipt";
pub const BOT: &str = "ntcb/Bot";

/// Topics that every component may read; nothing secret goes here.
pub const BROADCAST: [&str; 6] = [ENTER, EXIT, TICKER, NOTICE, LOG, STAT];

/// Command topic private to one bot.
pub fn bot(snow_id: i64) -> String {
    format!("{BOT}/{snow_id}")
}

pub fn bot_receipt(snow_id: i64) -> String {
    format!("{BOT}/{snow_id}/Receipt")
}

pub fn bot_job_start(snow_id: i64) -> String {
    format!("{BOT}/{snow_id}/JobStart")
}

pub fn bot_job_done(snow_id: i64) -> String {
    format!("{BOT}/{snow_id}/JobDone")
}

pub fn bot_output(snow_id: i64) -> String {
    format!("{BOT}/{snow_id}/Output")
}

/// MQTT filter matching: `+` matches one level, a trailing `#` matches the
/// remaining levels (including none).
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(f) = filter_levels.next() {
        if f == "#" {
            return filter_levels.peek().is_none();
        }
        match topic_levels.next() {
            Some(t) if f == "+" || f == t => continue,
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}
