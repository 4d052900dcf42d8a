//! Asynchronous event notification payloads.

use alloc::vec::Vec;

use crossbeam_queue::SegQueue;

use crate::cmd::Completion;

/// Asynchronous event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEventType {
    /// Error status
    ErrorStatus = 0,
    /// SMART/Health status
    SmartHealth = 1,
    /// Notice
    Notice = 2,
    /// I/O command set specific
    IoCommandSet = 6,
    /// Vendor specific
    VendorSpecific = 7,
}

/// Asynchronous event info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEventInfo {
    // Error status events
    InvalidSubmissionQueue,
    InvalidCompletionQueue,
    DiagnosticFailure,
    PersistentInternalError,
    TransientInternalError,
    FirmwareImageLoadError,

    // SMART/Health status events
    DeviceReliabilityDegraded,
    TemperatureAboveThreshold,
    MediaPlacedInReadOnly,

    // Notice events
    NamespaceAttributeChanged,
    FirmwareActivationStarting,
    TelemetryLogChanged,
    AsymmetricNamespaceAccessChange,

    // Anything else
    Other(u8),
}

/// A decoded asynchronous event notification.
#[derive(Debug, Clone, Copy)]
pub struct AsyncEvent {
    /// Event type
    pub event_type: AsyncEventType,
    /// Event information
    pub event_info: AsyncEventInfo,
    /// Associated log page ID (if any)
    pub log_page: Option<u8>,
}

impl AsyncEvent {
    /// Decode from completion entry dword 0.
    pub fn from_dw0(dw0: u32) -> Self {
        let event_type_raw = ((dw0 >> 16) & 0x7) as u8;
        let event_info_raw = ((dw0 >> 8) & 0xFF) as u8;
        let log_page = (dw0 & 0xFF) as u8;

        let event_type = match event_type_raw {
            0 => AsyncEventType::ErrorStatus,
            1 => AsyncEventType::SmartHealth,
            2 => AsyncEventType::Notice,
            6 => AsyncEventType::IoCommandSet,
            7 => AsyncEventType::VendorSpecific,
            _ => AsyncEventType::ErrorStatus,
        };

        let event_info = match (event_type, event_info_raw) {
            (AsyncEventType::ErrorStatus, 0) => AsyncEventInfo::InvalidSubmissionQueue,
            (AsyncEventType::ErrorStatus, 1) => AsyncEventInfo::InvalidCompletionQueue,
            (AsyncEventType::ErrorStatus, 2) => AsyncEventInfo::DiagnosticFailure,
            (AsyncEventType::ErrorStatus, 3) => AsyncEventInfo::PersistentInternalError,
            (AsyncEventType::ErrorStatus, 4) => AsyncEventInfo::TransientInternalError,
            (AsyncEventType::ErrorStatus, 5) => AsyncEventInfo::FirmwareImageLoadError,

            (AsyncEventType::SmartHealth, 0) => AsyncEventInfo::DeviceReliabilityDegraded,
            (AsyncEventType::SmartHealth, 1) => AsyncEventInfo::TemperatureAboveThreshold,
            (AsyncEventType::SmartHealth, 2) => AsyncEventInfo::MediaPlacedInReadOnly,

            (AsyncEventType::Notice, 0) => AsyncEventInfo::NamespaceAttributeChanged,
            (AsyncEventType::Notice, 1) => AsyncEventInfo::FirmwareActivationStarting,
            (AsyncEventType::Notice, 2) => AsyncEventInfo::TelemetryLogChanged,
            (AsyncEventType::Notice, 3) => AsyncEventInfo::AsymmetricNamespaceAccessChange,

            (_, raw) => AsyncEventInfo::Other(raw),
        };

        Self {
            event_type,
            event_info,
            log_page: (log_page != 0).then_some(log_page),
        }
    }

    /// Decode the notification carried by an AER completion.
    pub fn from_completion(cqe: &Completion) -> Self {
        Self::from_dw0(cqe.dw0())
    }

    /// Whether this event requires immediate attention.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.event_info,
            AsyncEventInfo::PersistentInternalError
                | AsyncEventInfo::TransientInternalError
                | AsyncEventInfo::FirmwareImageLoadError
                | AsyncEventInfo::DeviceReliabilityDegraded
                | AsyncEventInfo::MediaPlacedInReadOnly
        )
    }

    /// The log page to read for details on this event.
    pub fn recommended_log_page(&self) -> Option<u8> {
        self.log_page.or_else(|| match self.event_info {
            AsyncEventInfo::InvalidSubmissionQueue
            | AsyncEventInfo::InvalidCompletionQueue
            | AsyncEventInfo::DiagnosticFailure
            | AsyncEventInfo::PersistentInternalError
            | AsyncEventInfo::TransientInternalError
            | AsyncEventInfo::FirmwareImageLoadError => Some(0x01),

            AsyncEventInfo::DeviceReliabilityDegraded
            | AsyncEventInfo::TemperatureAboveThreshold
            | AsyncEventInfo::MediaPlacedInReadOnly => Some(0x02),

            AsyncEventInfo::NamespaceAttributeChanged => Some(0x04),
            AsyncEventInfo::FirmwareActivationStarting => Some(0x03),
            AsyncEventInfo::TelemetryLogChanged => Some(0x07),
            AsyncEventInfo::AsymmetricNamespaceAccessChange => Some(0x0C),

            _ => None,
        })
    }
}

/// A lock-free inbox for decoded events.
///
/// AER handlers run in completion context and are plain function pointers;
/// an application typically parks a static `AenQueue` next to the handler,
/// pushes from the handler and drains from wherever it processes events.
pub struct AenQueue {
    events: SegQueue<AsyncEvent>,
}

impl Default for AenQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AenQueue {
    pub fn new() -> Self {
        Self {
            events: SegQueue::new(),
        }
    }

    pub fn push(&self, event: AsyncEvent) {
        self.events.push(event);
    }

    pub fn pop(&self) -> Option<AsyncEvent> {
        self.events.pop()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<AsyncEvent> {
        let mut out = Vec::new();

        while let Some(event) = self.events.pop() {
            out.push(event);
        }

        out
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
