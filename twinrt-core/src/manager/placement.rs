//! Actor placement

use crate::message::MessageContext;
use std::fmt;

/// Where an actor should live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Construct the actor in this process
    Local,
    /// The actor belongs to another node
    Remote { node: String },
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Local => write!(f, "local"),
            Placement::Remote { node } => write!(f, "remote({node})"),
        }
    }
}

/// Decides placement for actors that are not resident yet
pub trait PlacementStrategy: Send + Sync {
    fn place(&self, ctx: &MessageContext) -> Placement;
}

/// Places every actor in this process
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPlacement;

impl PlacementStrategy for LocalPlacement {
    fn place(&self, _ctx: &MessageContext) -> Placement {
        Placement::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntityMsg;

    #[test]
    fn test_local_placement() {
        let ctx = MessageContext::new("device1", EntityMsg::default());
        assert_eq!(LocalPlacement.place(&ctx), Placement::Local);
        assert_eq!(
            Placement::Remote { node: "n2".into() }.to_string(),
            "remote(n2)"
        );
    }
}
