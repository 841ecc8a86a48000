//! Stock operations: write-then-await-response requests and plain reads.

use std::collections::VecDeque;
use std::fmt;

use log::debug;
use uuid::Uuid;

use super::{Interactor, Operation, OperationName, OperationState};
use crate::core::descriptor::WriteMode;
use crate::core::error::{OperationError, TransportError};

type PayloadFilter = Box<dyn Fn(&[u8]) -> bool + Send>;

/// Writes one or more frames to a target characteristic and collects the
/// responses pushed back for each of them.
///
/// Every frame is sent by its own `start` attempt; the next attempt begins
/// only once the previous frame's responses have been consumed.
pub struct RequestOperation {
    state: OperationState,
    target: Uuid,
    pending: VecDeque<Vec<u8>>,
    responses_per_frame: usize,
    received_in_frame: usize,
    in_flight: bool,
    responses: Vec<Vec<u8>>,
    filter: Option<PayloadFilter>,
}

impl RequestOperation {
    /// A single frame expecting one response on `response_from`.
    pub fn new(
        name: impl Into<OperationName>,
        target: Uuid,
        payload: Vec<u8>,
        response_from: Uuid,
    ) -> Self {
        Self::chunked(name, target, vec![payload], [response_from])
    }

    /// Several frames, each expecting one response on any of `response_from`.
    /// With no frames at all the request is finished before it is queued.
    pub fn chunked(
        name: impl Into<OperationName>,
        target: Uuid,
        frames: Vec<Vec<u8>>,
        response_from: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        let mut state = OperationState::new(name).with_responses_from(response_from);
        if frames.is_empty() {
            state.complete();
        }
        Self {
            state,
            target,
            pending: frames.into(),
            responses_per_frame: 1,
            received_in_frame: 0,
            in_flight: false,
            responses: Vec::new(),
            filter: None,
        }
    }

    /// A write whose only acknowledgement is the write callback.
    pub fn write_only(name: impl Into<OperationName>, target: Uuid, payload: Vec<u8>) -> Self {
        let mut op = Self::chunked(name, target, vec![payload], []);
        op.responses_per_frame = 0;
        op
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.state.set_response_timeout(timeout);
        self
    }

    pub fn with_responses_per_frame(mut self, count: usize) -> Self {
        self.responses_per_frame = count;
        self
    }

    /// Only payloads for which `filter` returns true are claimed.
    pub fn with_filter(mut self, filter: impl Fn(&[u8]) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn target(&self) -> Uuid {
        self.target
    }

    pub fn responses(&self) -> &[Vec<u8>] {
        &self.responses
    }

    pub fn into_responses(self) -> Vec<Vec<u8>> {
        self.responses
    }

    fn finish_frame(&mut self) {
        self.in_flight = false;
        if self.pending.is_empty() {
            self.state.complete();
        }
    }
}

impl fmt::Debug for RequestOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOperation")
            .field("name", self.state.name())
            .field("target", &self.target)
            .field("pending", &self.pending.len())
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl Operation for RequestOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn start(&mut self, link: &mut dyn Interactor) -> Result<(), OperationError> {
        let Some(frame) = self.pending.pop_front() else {
            self.state.complete();
            return Ok(());
        };

        self.in_flight = true;
        self.received_in_frame = 0;
        link.send(&frame, self.target)?;
        debug!("{} sent {} bytes to {}", self.state.name(), frame.len(), self.target);

        // Nothing will call back for an unacknowledged write.
        if self.responses_per_frame == 0 && link.write_mode(self.target) == WriteMode::WithoutResponse {
            self.finish_frame();
        }
        Ok(())
    }

    fn has_next_iteration(&self) -> bool {
        !self.in_flight && !self.pending.is_empty()
    }

    fn can_respond_on_write(&self, characteristic: Uuid) -> bool {
        characteristic == self.target
    }

    fn can_respond_on_data(&self, payload: &[u8]) -> bool {
        self.filter.as_ref().is_none_or(|f| f(payload))
    }

    fn on_value_updated(
        &mut self,
        characteristic: Uuid,
        payload: Option<&[u8]>,
        error: Option<&TransportError>,
    ) {
        if !self.state.accepts(characteristic) {
            return;
        }
        if let Some(e) = error {
            self.state.fail(e.clone().into());
            return;
        }
        if !self.in_flight || self.responses_per_frame == 0 {
            return;
        }
        if let Some(data) = payload {
            self.responses.push(data.to_vec());
        }
        self.received_in_frame += 1;
        if self.received_in_frame >= self.responses_per_frame {
            self.finish_frame();
        }
    }

    fn on_value_written(&mut self, characteristic: Uuid, error: Option<&TransportError>) {
        if let Some(e) = error {
            self.state.fail(e.clone().into());
            return;
        }
        if characteristic == self.target && self.in_flight && self.responses_per_frame == 0 {
            self.finish_frame();
        }
    }
}

/// Reads a characteristic once and keeps the value.
#[derive(Debug)]
pub struct ReadOperation {
    state: OperationState,
    target: Uuid,
    value: Option<Vec<u8>>,
}

impl ReadOperation {
    pub fn new(name: impl Into<OperationName>, target: Uuid) -> Self {
        Self {
            state: OperationState::new(name).with_responses_from([target]),
            target,
            value: None,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.state.set_response_timeout(timeout);
        self
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn into_value(self) -> Option<Vec<u8>> {
        self.value
    }
}

impl Operation for ReadOperation {
    fn state(&self) -> &OperationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperationState {
        &mut self.state
    }

    fn start(&mut self, link: &mut dyn Interactor) -> Result<(), OperationError> {
        link.read_value(self.target)?;
        Ok(())
    }

    fn on_value_updated(
        &mut self,
        _characteristic: Uuid,
        payload: Option<&[u8]>,
        error: Option<&TransportError>,
    ) {
        if let Some(e) = error {
            self.state.fail(e.clone().into());
            return;
        }
        self.value = payload.map(<[u8]>::to_vec);
        self.state.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::is_terminal;
    use crate::core::testing::uuid;

    #[derive(Default)]
    struct RecordingLink {
        sent: Vec<(Uuid, Vec<u8>)>,
        reads: Vec<Uuid>,
        mode: Option<WriteMode>,
    }

    impl Interactor for RecordingLink {
        fn send(&mut self, payload: &[u8], characteristic: Uuid) -> Result<(), TransportError> {
            self.sent.push((characteristic, payload.to_vec()));
            Ok(())
        }

        fn read_value(&mut self, characteristic: Uuid) -> Result<(), TransportError> {
            self.reads.push(characteristic);
            Ok(())
        }

        fn write_mode(&self, _characteristic: Uuid) -> WriteMode {
            self.mode.unwrap_or(WriteMode::WithResponse)
        }

        fn cached_value(&self, _characteristic: Uuid) -> Option<&[u8]> {
            None
        }
    }

    #[test]
    fn test_request_completes_on_response() {
        let mut link = RecordingLink::default();
        let mut op = RequestOperation::new("ping", uuid(1), vec![0xAA], uuid(2));
        assert!(op.has_next_iteration());
        op.start(&mut link).unwrap();
        assert_eq!(link.sent, vec![(uuid(1), vec![0xAA])]);

        op.on_value_written(uuid(1), None);
        assert!(!op.is_finished());
        assert!(!op.has_next_iteration());

        op.on_value_updated(uuid(2), Some(&[0xBB]), None);
        assert!(op.is_finished());
        assert_eq!(op.responses(), &[vec![0xBB]]);
    }

    #[test]
    fn test_chunked_request_iterates_per_frame() {
        let mut link = RecordingLink::default();
        let mut op = RequestOperation::chunked("upload", uuid(1), vec![vec![1], vec![2]], [uuid(2)]);

        op.start(&mut link).unwrap();
        op.on_value_updated(uuid(2), Some(&[0x01]), None);
        assert!(!op.is_finished());
        assert!(op.has_next_iteration());

        op.start(&mut link).unwrap();
        op.on_value_updated(uuid(2), Some(&[0x02]), None);
        assert!(op.is_finished());
        assert_eq!(link.sent.len(), 2);
        assert_eq!(op.into_responses(), vec![vec![0x01], vec![0x02]]);
    }

    #[test]
    fn test_write_only_finishes_on_ack() {
        let mut link = RecordingLink::default();
        let mut op = RequestOperation::write_only("set", uuid(1), vec![9]);
        op.start(&mut link).unwrap();
        assert!(!op.is_finished());
        op.on_value_written(uuid(1), None);
        assert!(op.is_finished());
    }

    #[test]
    fn test_unacknowledged_write_finishes_on_start() {
        let mut link = RecordingLink {
            mode: Some(WriteMode::WithoutResponse),
            ..Default::default()
        };
        let mut op = RequestOperation::write_only("set", uuid(1), vec![9]);
        op.start(&mut link).unwrap();
        assert!(op.is_finished());
    }

    #[test]
    fn test_filter_rejects_payload() {
        let op = RequestOperation::new("ping", uuid(1), vec![0xAA], uuid(2))
            .with_filter(|data| data.first() == Some(&0xBB));
        assert!(op.can_respond_on_data(&[0xBB, 0x00]));
        assert!(!op.can_respond_on_data(&[0x00]));
    }

    #[test]
    fn test_write_error_terminates() {
        let mut link = RecordingLink::default();
        let mut op = RequestOperation::new("ping", uuid(1), vec![0xAA], uuid(2));
        op.start(&mut link).unwrap();
        op.on_value_written(uuid(1), Some(&TransportError::Backend("refused".into())));
        assert!(is_terminal(&op));
        assert_eq!(
            op.error(),
            Some(&OperationError::Transport(TransportError::Backend("refused".into())))
        );
    }

    #[test]
    fn test_target_update_is_not_counted_as_response() {
        let mut link = RecordingLink::default();
        let mut op = RequestOperation::new("ping", uuid(1), vec![0xAA], uuid(2));
        assert!(!op.can_respond_on(uuid(1)));
        assert!(op.can_respond_on_write(uuid(1)));
        assert!(!op.can_respond_on_write(uuid(2)));

        op.start(&mut link).unwrap();
        op.on_value_updated(uuid(1), Some(&[0xEE]), None);
        assert!(!op.is_finished());
        assert!(op.responses().is_empty());

        op.on_value_updated(uuid(2), Some(&[0xBB]), None);
        assert_eq!(op.responses(), &[vec![0xBB]]);
        assert!(op.is_finished());
    }

    #[test]
    fn test_empty_frame_list_is_finished_up_front() {
        let op = RequestOperation::chunked("empty", uuid(1), Vec::new(), [uuid(2)]);
        assert!(op.is_finished());
        assert_eq!(op.error(), None);
        assert!(!op.has_next_iteration());
    }

    #[test]
    fn test_read_captures_value() {
        let mut link = RecordingLink::default();
        let mut op = ReadOperation::new("battery", uuid(3));
        op.start(&mut link).unwrap();
        assert_eq!(link.reads, vec![uuid(3)]);
        op.on_value_updated(uuid(3), Some(&[87]), None);
        assert!(op.is_finished());
        assert_eq!(op.value(), Some(&[87u8][..]));
    }
}
