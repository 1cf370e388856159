//! Prelude (helpful reexports) for this package

pub use crate::{
    backend::{
        axi::AxiBackend,
        pci::PciBackend,
        Backend,
    },
    cores::HardwareCore,
    device::Device,
    messages::{
        FramedSink,
        MessageId,
        MessageSink,
        PropertyId,
    },
    server::Server,
    session::Session,
    settings::Settings,
};
pub use zbnt_utils::{
    fdt::Fdt,
    firmware::BitstreamCatalog,
};
