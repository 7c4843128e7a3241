//! Apple Event pump for `.app` bundle launches.

use std::ffi::c_void;
use std::os::raw::c_long;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use super::{
    apple_event_kind, fourcc, AppleEventKind, DesktopEvent, EventPump, K_AE_GET_URL,
    K_AE_OPEN_DOCUMENTS, K_CORE_EVENT_CLASS, K_INTERNET_EVENT_CLASS,
};

type OSErr = i16;
type OSStatus = i32;
type DescType = u32;
type EventRef = *mut c_void;
type AEEventHandlerProc =
    extern "C" fn(event: *const AEDesc, reply: *mut AEDesc, refcon: *mut c_void) -> OSErr;

#[repr(C, packed(2))]
struct AEDesc {
    descriptor_type: DescType,
    data_handle: *mut c_void,
}

impl AEDesc {
    fn null() -> Self {
        AEDesc {
            descriptor_type: TYPE_NULL,
            data_handle: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
struct EventTypeSpec {
    event_class: u32,
    event_kind: u32,
}

const TYPE_NULL: DescType = fourcc(b"null");
const TYPE_WILD_CARD: DescType = fourcc(b"****");
const TYPE_AE_LIST: DescType = fourcc(b"list");
const TYPE_UTF8_TEXT: DescType = fourcc(b"utf8");
const TYPE_TYPE: DescType = fourcc(b"type");
const TYPE_KERNEL_PROCESS_ID: DescType = fourcc(b"kpid");
const KEY_DIRECT_OBJECT: u32 = fourcc(b"----");
const KEY_EVENT_CLASS_ATTR: u32 = fourcc(b"evcl");
const KEY_EVENT_ID_ATTR: u32 = fourcc(b"evid");
const K_EVENT_CLASS_APPLE_EVENT: u32 = fourcc(b"eppc");
const K_EVENT_APPLE_EVENT: u32 = 1;
const K_AUTO_GENERATE_RETURN_ID: i16 = -1;
const K_ANY_TRANSACTION_ID: i32 = 0;
const K_AE_NO_REPLY: i32 = 0x0000_0001;
const K_AE_CAN_INTERACT: i32 = 0x0000_0020;
const EVENT_LOOP_TIMED_OUT_ERR: OSStatus = -9875;
const NO_ERR: OSErr = 0;
/// About 1.5 seconds.
const SEND_TIMEOUT_TICKS: c_long = 90;
const MAX_PATH_BYTES: usize = 4096;

#[link(name = "Carbon", kind = "framework")]
extern "C" {
    fn ReceiveNextEvent(
        num_types: usize,
        list: *const EventTypeSpec,
        timeout: f64,
        pull_event: u8,
        out_event: *mut EventRef,
    ) -> OSStatus;
    fn ReleaseEvent(event: EventRef);
    fn AEProcessEvent(event: EventRef) -> OSStatus;
    fn AEInstallEventHandler(
        event_class: u32,
        event_id: u32,
        handler: AEEventHandlerProc,
        refcon: *mut c_void,
        is_sys_handler: u8,
    ) -> OSErr;
    fn AERemoveEventHandler(
        event_class: u32,
        event_id: u32,
        handler: AEEventHandlerProc,
        is_sys_handler: u8,
    ) -> OSErr;
    fn AEGetAttributePtr(
        event: *const AEDesc,
        keyword: u32,
        desired_type: DescType,
        type_code: *mut DescType,
        data: *mut c_void,
        max_size: c_long,
        actual_size: *mut c_long,
    ) -> OSErr;
    fn AEGetParamPtr(
        event: *const AEDesc,
        keyword: u32,
        desired_type: DescType,
        type_code: *mut DescType,
        data: *mut c_void,
        max_size: c_long,
        actual_size: *mut c_long,
    ) -> OSErr;
    fn AEGetParamDesc(
        event: *const AEDesc,
        keyword: u32,
        desired_type: DescType,
        result: *mut AEDesc,
    ) -> OSErr;
    fn AECountItems(list: *const AEDesc, count: *mut c_long) -> OSErr;
    fn AEGetNthPtr(
        list: *const AEDesc,
        index: c_long,
        desired_type: DescType,
        keyword: *mut u32,
        type_code: *mut DescType,
        data: *mut c_void,
        max_size: c_long,
        actual_size: *mut c_long,
    ) -> OSErr;
    fn AECreateDesc(
        type_code: DescType,
        data: *const c_void,
        size: c_long,
        result: *mut AEDesc,
    ) -> OSErr;
    fn AECreateList(
        factoring: *const c_void,
        factored_size: c_long,
        is_record: u8,
        result: *mut AEDesc,
    ) -> OSErr;
    fn AEPutPtr(
        list: *mut AEDesc,
        index: c_long,
        type_code: DescType,
        data: *const c_void,
        size: c_long,
    ) -> OSErr;
    fn AECreateAppleEvent(
        event_class: u32,
        event_id: u32,
        target: *const AEDesc,
        return_id: i16,
        transaction_id: i32,
        result: *mut AEDesc,
    ) -> OSErr;
    fn AEPutParamDesc(event: *mut AEDesc, keyword: u32, desc: *const AEDesc) -> OSErr;
    fn AESendMessage(
        event: *const AEDesc,
        reply: *mut AEDesc,
        send_mode: i32,
        timeout_ticks: c_long,
    ) -> OSStatus;
    fn AEDisposeDesc(desc: *mut AEDesc) -> OSErr;
}

/// Disposes the wrapped descriptor on drop.
struct OwnedDesc(AEDesc);

impl Drop for OwnedDesc {
    fn drop(&mut self) {
        unsafe {
            AEDisposeDesc(&mut self.0);
        }
    }
}

fn check(err: OSErr, what: &str) -> Result<()> {
    if err != NO_ERR {
        anyhow::bail!("{what} failed: OSErr {err}");
    }
    Ok(())
}

/// Collects open-documents and get-URL Apple Events through the Carbon event
/// queue.
pub struct AppleEventPump {
    // Boxed so the address handed to the AE handler stays put.
    inbox: Box<Vec<DesktopEvent>>,
}

impl AppleEventPump {
    pub fn install() -> Result<Self> {
        let mut inbox = Box::new(Vec::new());
        let refcon = inbox.as_mut() as *mut Vec<DesktopEvent> as *mut c_void;
        // Wildcards: the specific (aevt, odoc) registration is never called
        // for events received through the Carbon queue.
        let err = unsafe {
            AEInstallEventHandler(TYPE_WILD_CARD, TYPE_WILD_CARD, handle_apple_event, refcon, 0)
        };
        check(err, "AEInstallEventHandler")?;
        debug!(target: "bootld", "apple event handler installed");
        Ok(AppleEventPump { inbox })
    }
}

impl Drop for AppleEventPump {
    fn drop(&mut self) {
        unsafe {
            AERemoveEventHandler(TYPE_WILD_CARD, TYPE_WILD_CARD, handle_apple_event, 0);
        }
    }
}

impl EventPump for AppleEventPump {
    fn next_events(&mut self, timeout: Duration) -> Vec<DesktopEvent> {
        let types = [EventTypeSpec {
            event_class: K_EVENT_CLASS_APPLE_EVENT,
            event_kind: K_EVENT_APPLE_EVENT,
        }];
        loop {
            let mut event: EventRef = std::ptr::null_mut();
            let status = unsafe {
                ReceiveNextEvent(1, types.as_ptr(), timeout.as_secs_f64(), 1, &mut event)
            };
            if status == EVENT_LOOP_TIMED_OUT_ERR {
                break;
            }
            if status != 0 {
                debug!(target: "bootld", "ReceiveNextEvent failed: {status}");
                break;
            }
            let status = unsafe { AEProcessEvent(event) };
            unsafe { ReleaseEvent(event) };
            if status != 0 {
                debug!(target: "bootld", "AEProcessEvent failed: {status}");
                break;
            }
        }
        std::mem::take(self.inbox.as_mut())
    }

    fn forward(&mut self, child_pid: u32, event: &DesktopEvent) -> Result<()> {
        let pid = child_pid as libc::pid_t;
        unsafe {
            let mut target = OwnedDesc(AEDesc::null());
            check(
                AECreateDesc(
                    TYPE_KERNEL_PROCESS_ID,
                    &pid as *const libc::pid_t as *const c_void,
                    std::mem::size_of::<libc::pid_t>() as c_long,
                    &mut target.0,
                ),
                "AECreateDesc",
            )?;

            let (class, id) = match event {
                DesktopEvent::OpenDocuments(_) => (K_CORE_EVENT_CLASS, K_AE_OPEN_DOCUMENTS),
                DesktopEvent::OpenUrl(_) => (K_INTERNET_EVENT_CLASS, K_AE_GET_URL),
            };
            let mut direct = OwnedDesc(AEDesc::null());
            match event {
                DesktopEvent::OpenDocuments(paths) => {
                    check(AECreateList(std::ptr::null(), 0, 0, &mut direct.0), "AECreateList")?;
                    for (i, path) in paths.iter().enumerate() {
                        check(
                            AEPutPtr(
                                &mut direct.0,
                                (i + 1) as c_long,
                                TYPE_UTF8_TEXT,
                                path.as_ptr() as *const c_void,
                                path.len() as c_long,
                            ),
                            "AEPutPtr",
                        )?;
                    }
                }
                DesktopEvent::OpenUrl(url) => check(
                    AECreateDesc(
                        TYPE_UTF8_TEXT,
                        url.as_ptr() as *const c_void,
                        url.len() as c_long,
                        &mut direct.0,
                    ),
                    "AECreateDesc",
                )?,
            }

            let mut copy = OwnedDesc(AEDesc::null());
            check(
                AECreateAppleEvent(
                    class,
                    id,
                    &target.0,
                    K_AUTO_GENERATE_RETURN_ID,
                    K_ANY_TRANSACTION_ID,
                    &mut copy.0,
                ),
                "AECreateAppleEvent",
            )?;
            check(
                AEPutParamDesc(&mut copy.0, KEY_DIRECT_OBJECT, &direct.0),
                "AEPutParamDesc",
            )?;

            let mut reply = OwnedDesc(AEDesc::null());
            let status = AESendMessage(
                &copy.0,
                &mut reply.0,
                K_AE_NO_REPLY | K_AE_CAN_INTERACT,
                SEND_TIMEOUT_TICKS,
            );
            if status != 0 {
                anyhow::bail!("AESendMessage failed: OSStatus {status}");
            }
        }
        debug!(target: "bootld", "forwarded {event:?} to child {child_pid}");
        Ok(())
    }
}

extern "C" fn handle_apple_event(
    event: *const AEDesc,
    _reply: *mut AEDesc,
    refcon: *mut c_void,
) -> OSErr {
    if refcon.is_null() {
        return NO_ERR;
    }
    let inbox = unsafe { &mut *(refcon as *mut Vec<DesktopEvent>) };
    let kind = match (
        event_attr(event, KEY_EVENT_CLASS_ATTR),
        event_attr(event, KEY_EVENT_ID_ATTR),
    ) {
        (Some(class), Some(id)) => apple_event_kind(class, id),
        _ => None,
    };
    let parsed = match kind {
        Some(AppleEventKind::OpenDocuments) => document_paths(event).map(DesktopEvent::OpenDocuments),
        Some(AppleEventKind::GetUrl) => event_url(event).map(DesktopEvent::OpenUrl),
        None => {
            debug!(target: "bootld", "ignoring unhandled apple event");
            return NO_ERR;
        }
    };
    match parsed {
        Ok(parsed) => inbox.push(parsed),
        Err(err) => warn!(target: "bootld", "unreadable apple event: {err:#}"),
    }
    NO_ERR
}

fn event_attr(event: *const AEDesc, keyword: u32) -> Option<u32> {
    let mut value: u32 = 0;
    let mut type_code: DescType = 0;
    let mut size: c_long = 0;
    let err = unsafe {
        AEGetAttributePtr(
            event,
            keyword,
            TYPE_TYPE,
            &mut type_code,
            &mut value as *mut u32 as *mut c_void,
            std::mem::size_of::<u32>() as c_long,
            &mut size,
        )
    };
    (err == NO_ERR).then_some(value)
}

fn event_url(event: *const AEDesc) -> Result<String> {
    let mut buf = vec![0u8; MAX_PATH_BYTES];
    let mut type_code: DescType = 0;
    let mut size: c_long = 0;
    let err = unsafe {
        AEGetParamPtr(
            event,
            KEY_DIRECT_OBJECT,
            TYPE_UTF8_TEXT,
            &mut type_code,
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as c_long,
            &mut size,
        )
    };
    check(err, "AEGetParamPtr")?;
    let len = (size.max(0) as usize).min(buf.len());
    Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn document_paths(event: *const AEDesc) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    unsafe {
        let mut docs = OwnedDesc(AEDesc::null());
        check(
            AEGetParamDesc(event, KEY_DIRECT_OBJECT, TYPE_AE_LIST, &mut docs.0),
            "AEGetParamDesc",
        )?;
        let mut count: c_long = 0;
        check(AECountItems(&docs.0, &mut count), "AECountItems")?;

        let mut buf = vec![0u8; MAX_PATH_BYTES];
        for index in 1..=count {
            let mut keyword: u32 = 0;
            let mut type_code: DescType = 0;
            let mut size: c_long = 0;
            let err = AEGetNthPtr(
                &docs.0,
                index,
                TYPE_UTF8_TEXT,
                &mut keyword,
                &mut type_code,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as c_long,
                &mut size,
            );
            if err != NO_ERR {
                debug!(target: "bootld", "document {index} unreadable: OSErr {err}");
                continue;
            }
            let len = (size.max(0) as usize).min(buf.len());
            paths.push(String::from_utf8_lossy(&buf[..len]).into_owned());
        }
    }
    Ok(paths)
}
