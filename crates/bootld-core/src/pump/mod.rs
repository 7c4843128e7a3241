//! Desktop event pump consulted while the child runs.
//!
//! macOS delivers "open these documents" and "open this URL" requests to the
//! application bundle's main process, which is the launcher, not the child. A
//! pump drains those requests: before the child exists they become extra
//! arguments, afterwards they are re-sent to the child.

use std::ffi::OsString;
use std::time::Duration;

use anyhow::Result;

#[cfg(all(target_os = "macos", feature = "windowed"))]
mod apple_events;

#[cfg(all(target_os = "macos", feature = "windowed"))]
pub use apple_events::AppleEventPump;

/// Upper bound on one drain while waiting for the child.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesktopEvent {
    OpenDocuments(Vec<String>),
    /// A custom URL scheme registered by the bundle was opened.
    OpenUrl(String),
}

/// Apple Event kinds the launcher acts on.
#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppleEventKind {
    OpenDocuments,
    GetUrl,
}

#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) const K_CORE_EVENT_CLASS: u32 = fourcc(b"aevt");
#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) const K_AE_OPEN_DOCUMENTS: u32 = fourcc(b"odoc");
#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) const K_INTERNET_EVENT_CLASS: u32 = fourcc(b"GURL");
#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) const K_AE_GET_URL: u32 = fourcc(b"GURL");

/// Maps an Apple Event's class and id attributes to the kind handled here.
#[cfg_attr(not(all(target_os = "macos", feature = "windowed")), allow(dead_code))]
pub(crate) fn apple_event_kind(class: u32, id: u32) -> Option<AppleEventKind> {
    match (class, id) {
        (K_CORE_EVENT_CLASS, K_AE_OPEN_DOCUMENTS) => Some(AppleEventKind::OpenDocuments),
        (K_INTERNET_EVENT_CLASS, K_AE_GET_URL) => Some(AppleEventKind::GetUrl),
        _ => None,
    }
}

pub trait EventPump {
    /// Collects queued events, blocking for at most `timeout` when the queue
    /// is empty.
    fn next_events(&mut self, timeout: Duration) -> Vec<DesktopEvent>;

    /// Re-sends `event` to the running child.
    fn forward(&mut self, child_pid: u32, event: &DesktopEvent) -> Result<()>;
}

/// Pump used by [`crate::child::create_child`] on this build, if any.
#[cfg(all(target_os = "macos", feature = "windowed"))]
pub fn native_pump() -> Option<Box<dyn EventPump>> {
    match AppleEventPump::install() {
        Ok(pump) => Some(Box::new(pump)),
        Err(err) => {
            tracing::warn!(target: "bootld", "apple event handler not installed: {err:#}");
            None
        }
    }
}

#[cfg(not(all(target_os = "macos", feature = "windowed")))]
pub fn native_pump() -> Option<Box<dyn EventPump>> {
    None
}

/// Drains the queue once and turns open requests into arguments.
pub fn drain_into_args(pump: &mut dyn EventPump, timeout: Duration, args: &mut Vec<OsString>) {
    for event in pump.next_events(timeout) {
        match event {
            DesktopEvent::OpenDocuments(paths) => {
                tracing::debug!(target: "bootld", "appending {} document(s) to argv", paths.len());
                args.extend(paths.into_iter().map(OsString::from));
            }
            DesktopEvent::OpenUrl(url) => {
                tracing::debug!(target: "bootld", "appending url {url} to argv");
                args.push(OsString::from(url));
            }
        }
    }
}

/// Drains the queue once and re-sends everything to `child_pid`. Forwarding
/// failures are logged and dropped.
pub fn drain_to_child(pump: &mut dyn EventPump, timeout: Duration, child_pid: u32) {
    for event in pump.next_events(timeout) {
        if let Err(err) = pump.forward(child_pid, &event) {
            tracing::warn!(target: "bootld", "forwarding event to child {child_pid} failed: {err:#}");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPump;
    use super::*;

    fn open(paths: &[&str]) -> DesktopEvent {
        DesktopEvent::OpenDocuments(paths.iter().map(|p| p.to_string()).collect())
    }

    #[test]
    fn documents_before_spawn_become_arguments() {
        let mut pump = ScriptedPump::new(vec![vec![open(&["/a.txt", "/b.txt"]), open(&["/c"])]]);
        let mut args = vec![OsString::from("app"), OsString::from("--flag")];
        drain_into_args(&mut pump, Duration::ZERO, &mut args);
        let expected: Vec<OsString> = ["app", "--flag", "/a.txt", "/b.txt", "/c"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn urls_before_spawn_become_arguments_in_order() {
        let mut pump = ScriptedPump::new(vec![vec![
            DesktopEvent::OpenUrl("myapp://first".to_string()),
            open(&["/doc"]),
            DesktopEvent::OpenUrl("myapp://second".to_string()),
        ]]);
        let mut args = vec![OsString::from("app")];
        drain_into_args(&mut pump, Duration::ZERO, &mut args);
        let expected: Vec<OsString> = ["app", "myapp://first", "/doc", "myapp://second"]
            .iter()
            .map(OsString::from)
            .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn urls_after_spawn_are_forwarded() {
        let url = DesktopEvent::OpenUrl("myapp://open?id=3".to_string());
        let mut pump = ScriptedPump::new(vec![vec![url.clone()]]);
        drain_to_child(&mut pump, POLL_INTERVAL, 77);
        assert_eq!(pump.forwarded, vec![(77, url)]);
    }

    #[test]
    fn apple_event_kinds() {
        assert_eq!(
            apple_event_kind(fourcc(b"aevt"), fourcc(b"odoc")),
            Some(AppleEventKind::OpenDocuments)
        );
        assert_eq!(
            apple_event_kind(fourcc(b"GURL"), fourcc(b"GURL")),
            Some(AppleEventKind::GetUrl)
        );
        assert_eq!(apple_event_kind(0x4755_524c, 0x4755_524c), Some(AppleEventKind::GetUrl));
        assert_eq!(apple_event_kind(fourcc(b"aevt"), fourcc(b"quit")), None);
        assert_eq!(apple_event_kind(fourcc(b"aevt"), fourcc(b"GURL")), None);
        assert_eq!(apple_event_kind(fourcc(b"GURL"), fourcc(b"odoc")), None);
    }

    #[test]
    fn documents_after_spawn_are_forwarded() {
        let mut pump = ScriptedPump::new(vec![vec![open(&["/x"])]]);
        drain_to_child(&mut pump, POLL_INTERVAL, 4242);
        assert_eq!(pump.forwarded, vec![(4242, open(&["/x"]))]);
    }

    #[test]
    fn forward_failure_is_not_fatal() {
        let mut pump = ScriptedPump::new(vec![vec![open(&["/x"]), open(&["/y"])]]);
        pump.fail_forward = true;
        drain_to_child(&mut pump, POLL_INTERVAL, 1);
        assert!(pump.forwarded.is_empty());
        assert_eq!(pump.polls, 1);
    }
}
