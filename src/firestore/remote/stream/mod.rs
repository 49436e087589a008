mod persistent;

pub use persistent::{
    ListenKind, PersistentStream, PersistentStreamState, StreamKind, StreamListener, WriteKind,
};
