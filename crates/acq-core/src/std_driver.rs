//! Helpers shared by driver implementations.

use crate::config::Config;
use crate::datafeed::{Header, Packet};
use crate::device::{DeviceInstance, DeviceStatus};
use crate::error::{AcqError, AcqResult};
use crate::session::Session;

/// Send the header that opens every acquisition.
pub fn send_header(session: &Session, sdi: &DeviceInstance) -> AcqResult<()> {
    tracing::debug!(device = %sdi.id(), "Sending header packet");
    session.send(sdi, &Packet::Header(Header::now()))
}

/// Send the end packet that closes every acquisition.
pub fn send_end(session: &Session, sdi: &DeviceInstance) -> AcqResult<()> {
    tracing::debug!(device = %sdi.id(), "Sending end packet");
    session.send(sdi, &Packet::End)
}

/// Report configuration that changed during an acquisition. Every item must
/// carry the type its key declares.
pub fn send_meta(session: &Session, sdi: &DeviceInstance, config: Vec<Config>) -> AcqResult<()> {
    if config.is_empty() {
        return Err(AcqError::arg("meta packet without items"));
    }
    for item in &config {
        item.check()?;
    }
    tracing::debug!(device = %sdi.id(), items = config.len(), "Sending meta packet");
    session.send(sdi, &Packet::Meta(config))
}

/// Stop a transport-driven acquisition: unregister the transport's event
/// source, drop unread input and send the end packet. The device stays open.
pub fn serial_acquisition_stop(session: &Session, sdi: &mut DeviceInstance) -> AcqResult<()> {
    if sdi.status != DeviceStatus::Active {
        return Err(AcqError::DeviceClosed);
    }
    let id = sdi.id();
    let Some(conn) = sdi.conn.as_mut() else {
        return Err(AcqError::bug(format!("{} has no transport", id)));
    };
    sdi.status = DeviceStatus::Stopping;
    session.source_remove(conn.poll_object())?;
    if let Err(e) = conn.flush_input() {
        tracing::warn!(device = %id, error = %e, "Failed to flush transport input");
    }

    sdi.status = DeviceStatus::Active;
    send_end(session, sdi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigKey, ConfigValue};
    use crate::device::{ChannelKind, Device};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_send_meta_reaches_subscribers() {
        let session = Session::new().unwrap();
        let mut sdi = DeviceInstance::new("Virtual", "V1", "0");
        sdi.add_channel(ChannelKind::Logic, "D0", true);
        let device = Device::new(sdi);
        session.add_device(&device).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        session.add_datafeed_callback(move |_, packet| sink.borrow_mut().push(packet.clone()));

        let rate = Config::new(ConfigKey::SampleRate, ConfigValue::UInt64(1_000));
        send_meta(&session, &device.lock(), vec![rate.clone()]).unwrap();
        assert_eq!(*seen.borrow(), vec![Packet::Meta(vec![rate])]);

        let bad = Config::new(ConfigKey::SampleRate, ConfigValue::Bool(true));
        assert!(matches!(send_meta(&session, &device.lock(), vec![bad]), Err(AcqError::Arg(_))));
        assert!(matches!(send_meta(&session, &device.lock(), Vec::new()), Err(AcqError::Arg(_))));
        assert_eq!(seen.borrow().len(), 1);
    }
}
