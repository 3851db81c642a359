//! Driver → client event path.
//!
//! The dispatcher reads the to-clients broadcast and fans events out to
//! a listener. Correlated responses (`OperationSucceeded`,
//! `ErrorResponse`, `OnNewPublication`) are filtered by the active
//! correlation id so a client only sees answers to its own outstanding
//! request; image events are delivered to every listener regardless of
//! correlation. The response kinds are dispatched as disjoint cases: a
//! succeeded operation never doubles as an error.

use std::path::Path;
use std::time::{Duration, Instant};

use crate::buffer::MappedFile;
use crate::concurrent::broadcast::{BroadcastError, BroadcastReceiver};
use crate::driver::DriverPaths;
use crate::protocol::control::{
    DriverEvent, ErrorCode, InactiveImageEvent, NewImageEvent, NewPublicationEvent,
};
use crate::trace::warn;

use super::ClientError;

/// Receives driver events.
pub trait DriverListener {
    fn on_new_publication(&mut self, _event: &NewPublicationEvent) {}
    fn on_new_image(&mut self, _event: &NewImageEvent) {}
    fn on_inactive_image(&mut self, _event: &InactiveImageEvent) {}
    fn on_operation_succeeded(&mut self, _correlation_id: u64) {}
    fn on_error(&mut self, _code: ErrorCode, _message: &str, _correlation_id: u64) {}
}

/// The terminal answer to one correlated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverResponse {
    Succeeded,
    NewPublication(NewPublicationEvent),
    Error { code: ErrorCode, message: String },
}

/// The event-receiving half of a client.
pub struct DriverEventDispatcher {
    receiver: BroadcastReceiver,
    // Keeps the broadcast mapping alive; absent when the dispatcher is
    // built over a heap buffer in tests.
    _map: Option<MappedFile>,
}

impl DriverEventDispatcher {
    /// Maps the broadcast buffer of the driver at `dir`. Connect before
    /// issuing commands or their responses may precede the cursor.
    pub fn connect(dir: &Path) -> Result<Self, ClientError> {
        let paths = DriverPaths::new(dir);
        let map = MappedFile::open_existing(&paths.to_clients())?;
        let receiver = BroadcastReceiver::new(map.buffer())?;
        Ok(Self {
            receiver,
            _map: Some(map),
        })
    }

    /// Drains available events to `listener`, filtering correlated
    /// responses by `active_correlation_id`. Returns events delivered.
    ///
    /// # Errors
    ///
    /// [`ClientError::Lapped`] when the driver outran this client; the
    /// cursor has already been reset and polling may simply continue.
    pub fn poll(
        &mut self,
        listener: &mut dyn DriverListener,
        active_correlation_id: u64,
    ) -> Result<usize, ClientError> {
        let mut delivered = 0usize;

        loop {
            let more = self.receiver.receive(|msg_type_id, body| {
                let event = match DriverEvent::decode(msg_type_id, body) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "undecodable driver event dropped");
                        return;
                    }
                };
                match event {
                    DriverEvent::NewPublication(event) => {
                        if event.correlation_id == active_correlation_id {
                            listener.on_new_publication(&event);
                        }
                    }
                    DriverEvent::NewImage(event) => listener.on_new_image(&event),
                    DriverEvent::InactiveImage(event) => listener.on_inactive_image(&event),
                    DriverEvent::OperationSucceeded(event) => {
                        if event.correlation_id == active_correlation_id {
                            listener.on_operation_succeeded(event.correlation_id);
                        }
                    }
                    DriverEvent::ErrorResponse(event) => {
                        if event.correlation_id == active_correlation_id {
                            listener.on_error(event.code, &event.message, event.correlation_id);
                        }
                    }
                }
            });

            match more {
                Ok(true) => delivered += 1,
                Ok(false) => break,
                Err(BroadcastError::Lapped) => return Err(ClientError::Lapped),
                Err(e) => return Err(e.into()),
            }
        }

        Ok(delivered)
    }

    /// Blocks (politely) until the response for `correlation_id` arrives
    /// or `timeout` passes, delivering uncorrelated events to `listener`
    /// along the way.
    pub fn await_response(
        &mut self,
        correlation_id: u64,
        timeout: Duration,
        listener: &mut dyn DriverListener,
    ) -> Result<DriverResponse, ClientError> {
        struct Await<'a> {
            inner: &'a mut dyn DriverListener,
            response: Option<DriverResponse>,
        }

        impl DriverListener for Await<'_> {
            fn on_new_publication(&mut self, event: &NewPublicationEvent) {
                self.response = Some(DriverResponse::NewPublication(event.clone()));
                self.inner.on_new_publication(event);
            }

            fn on_new_image(&mut self, event: &NewImageEvent) {
                self.inner.on_new_image(event);
            }

            fn on_inactive_image(&mut self, event: &InactiveImageEvent) {
                self.inner.on_inactive_image(event);
            }

            fn on_operation_succeeded(&mut self, correlation_id: u64) {
                self.response = Some(DriverResponse::Succeeded);
                self.inner.on_operation_succeeded(correlation_id);
            }

            fn on_error(&mut self, code: ErrorCode, message: &str, correlation_id: u64) {
                self.response = Some(DriverResponse::Error {
                    code,
                    message: message.to_string(),
                });
                self.inner.on_error(code, message, correlation_id);
            }
        }

        let deadline = Instant::now() + timeout;
        let mut waiter = Await {
            inner: listener,
            response: None,
        };

        loop {
            match self.poll(&mut waiter, correlation_id) {
                Ok(_) => {}
                // Responses may have been in the lost window; keep
                // waiting for the timeout to decide.
                Err(ClientError::Lapped) => {}
                Err(e) => return Err(e),
            }
            if let Some(response) = waiter.response.take() {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::DriverTimeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent::AtomicBuffer;
    use crate::concurrent::broadcast::BroadcastTransmitter;
    use crate::protocol::control::{
        self, ErrorResponseEvent, OperationSucceededEvent, msg_type,
    };

    #[derive(Default)]
    struct Recording {
        succeeded: Vec<u64>,
        errors: Vec<(ErrorCode, u64)>,
        publications: Vec<NewPublicationEvent>,
        images: Vec<NewImageEvent>,
        inactive: Vec<u64>,
    }

    impl DriverListener for Recording {
        fn on_new_publication(&mut self, event: &NewPublicationEvent) {
            self.publications.push(event.clone());
        }

        fn on_new_image(&mut self, event: &NewImageEvent) {
            self.images.push(event.clone());
        }

        fn on_inactive_image(&mut self, event: &InactiveImageEvent) {
            self.inactive.push(event.correlation_id);
        }

        fn on_operation_succeeded(&mut self, correlation_id: u64) {
            self.succeeded.push(correlation_id);
        }

        fn on_error(&mut self, code: ErrorCode, _message: &str, correlation_id: u64) {
            self.errors.push((code, correlation_id));
        }
    }

    fn dispatcher_over(buffer: AtomicBuffer) -> DriverEventDispatcher {
        // Test-only construction over a heap buffer instead of a file.
        DriverEventDispatcher {
            receiver: BroadcastReceiver::new(buffer).unwrap(),
            _map: None,
        }
    }

    fn transmit<T: serde::Serialize>(tx: &mut BroadcastTransmitter, msg_type_id: u32, body: &T) {
        tx.transmit(msg_type_id, &control::encode(body).unwrap())
            .unwrap();
    }

    #[test]
    fn correlated_responses_are_filtered() {
        let mut backing = vec![0u8; 4096 + crate::concurrent::broadcast::TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let mut tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut dispatcher = dispatcher_over(buffer);

        transmit(&mut tx, msg_type::OPERATION_SUCCEEDED, &OperationSucceededEvent {
            correlation_id: 41,
        });
        transmit(&mut tx, msg_type::OPERATION_SUCCEEDED, &OperationSucceededEvent {
            correlation_id: 42,
        });

        let mut listener = Recording::default();
        dispatcher.poll(&mut listener, 42).unwrap();

        // Only the active correlation id is delivered.
        assert_eq!(listener.succeeded, vec![42]);
    }

    #[test]
    fn success_and_error_are_disjoint() {
        let mut backing = vec![0u8; 4096 + crate::concurrent::broadcast::TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let mut tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut dispatcher = dispatcher_over(buffer);

        transmit(&mut tx, msg_type::OPERATION_SUCCEEDED, &OperationSucceededEvent {
            correlation_id: 7,
        });

        let mut listener = Recording::default();
        dispatcher.poll(&mut listener, 7).unwrap();

        // A succeeded operation must not also surface as an error.
        assert_eq!(listener.succeeded, vec![7]);
        assert!(listener.errors.is_empty());
    }

    #[test]
    fn image_events_fan_out_regardless_of_correlation() {
        let mut backing = vec![0u8; 4096 + crate::concurrent::broadcast::TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let mut tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut dispatcher = dispatcher_over(buffer);

        transmit(&mut tx, msg_type::ON_NEW_IMAGE, &NewImageEvent {
            correlation_id: 9_000,
            session_id: 5,
            stream_id: 10,
            channel: "udp://127.0.0.1:40123".to_string(),
            initial_term_id: 1,
            join_position: 0,
            log_dir: "/tmp/img".to_string(),
            subscriber_position_counter: 3,
            source: "127.0.0.1:50000".to_string(),
        });

        let mut listener = Recording::default();
        dispatcher.poll(&mut listener, 1).unwrap();
        assert_eq!(listener.images.len(), 1);
        assert_eq!(listener.images[0].session_id, 5);
    }

    #[test]
    fn error_response_reaches_listener_with_code() {
        let mut backing = vec![0u8; 4096 + crate::concurrent::broadcast::TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let mut tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut dispatcher = dispatcher_over(buffer);

        transmit(&mut tx, msg_type::ERROR_RESPONSE, &ErrorResponseEvent {
            correlation_id: 13,
            code: ErrorCode::PublicationChannelAlreadyExists,
            message: "udp://127.0.0.1:40123 stream 10".to_string(),
        });

        let mut listener = Recording::default();
        dispatcher.poll(&mut listener, 13).unwrap();
        assert_eq!(
            listener.errors,
            vec![(ErrorCode::PublicationChannelAlreadyExists, 13)]
        );
    }

    #[test]
    fn await_response_times_out_without_driver() {
        let mut backing = vec![0u8; 4096 + crate::concurrent::broadcast::TRAILER_LENGTH];
        let buffer = AtomicBuffer::wrap(&mut backing);
        let _tx = BroadcastTransmitter::new(buffer).unwrap();
        let mut dispatcher = dispatcher_over(buffer);

        let mut listener = Recording::default();
        let result =
            dispatcher.await_response(1, Duration::from_millis(50), &mut listener);
        assert!(matches!(result, Err(ClientError::DriverTimeout(_))));
    }
}
