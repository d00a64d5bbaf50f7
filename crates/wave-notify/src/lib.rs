pub mod error;
pub mod sink;
pub mod types;

pub use error::*;
pub use sink::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::{
        ChannelInbox, ChannelSender, DirectoryInbox, NotifyError, PushMessage, PushSink,
        PushSource,
    };
    use std::any::TypeId;

    #[test]
    fn crate_root_reexports_types() {
        let _ = TypeId::of::<NotifyError>();
        let _ = TypeId::of::<PushMessage>();
        let _ = TypeId::of::<DirectoryInbox>();
        let _ = TypeId::of::<ChannelInbox>();
        let _ = TypeId::of::<ChannelSender>();
    }

    #[test]
    fn transports_are_usable_as_trait_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inbox = DirectoryInbox::new(dir.path());
        let sink: &dyn PushSink = &inbox;
        let source: &dyn PushSource = &inbox;
        sink.deliver(&PushMessage::worker_complete("A", "done"))
            .expect("deliver");
        assert_eq!(source.drain().len(), 1);
    }
}
