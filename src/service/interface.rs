//! Interface registry with per-interface operation tables.
//!
//! Interfaces are keyed by `(syntax, manager type)`. Registration is
//! idempotent and visible to running listeners immediately.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::core::packet::{provider_reason, ContextElement, ContextResult};
use crate::core::syntax::SyntaxId;
use crate::error::{constants, ProtocolError, Result, RpcError};
use crate::protocol::message::Message;

pub type OperationHandler = dyn Fn(&mut Message) -> Result<Message> + Send + Sync + 'static;

/// Registration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterfaceFlags(pub u32);

impl InterfaceFlags {
    /// Registering starts listening; unregistering stops it again.
    pub const AUTO_LISTEN: InterfaceFlags = InterfaceFlags(0x01);
    /// Every operation number is routed to the first handler.
    pub const ACCEPTS_UNTYPED_DISPATCH: InterfaceFlags = InterfaceFlags(0x02);

    pub const fn empty() -> Self {
        InterfaceFlags(0)
    }

    pub const fn contains(self, other: InterfaceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for InterfaceFlags {
    type Output = InterfaceFlags;

    fn bitor(self, rhs: InterfaceFlags) -> InterfaceFlags {
        InterfaceFlags(self.0 | rhs.0)
    }
}

/// An interface and its operation table.
pub struct RegisteredInterface {
    pub syntax: SyntaxId,
    pub transfer_syntax: SyntaxId,
    pub manager_type: Uuid,
    pub flags: InterfaceFlags,
    operations: Vec<Arc<OperationHandler>>,
}

impl RegisteredInterface {
    pub fn new(syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            syntax,
            transfer_syntax,
            manager_type: Uuid::nil(),
            flags: InterfaceFlags::empty(),
            operations: Vec::new(),
        }
    }

    /// Append the handler for the next operation number.
    pub fn with_operation<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Message) -> Result<Message> + Send + Sync + 'static,
    {
        self.operations.push(Arc::new(handler));
        self
    }

    pub fn with_manager_type(mut self, manager_type: Uuid) -> Self {
        self.manager_type = manager_type;
        self
    }

    pub fn with_flags(mut self, flags: InterfaceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Handler for `opnum`, bounds-checked against the table.
    pub fn operation(&self, opnum: u16) -> Result<Arc<OperationHandler>> {
        let index = if self.flags.contains(InterfaceFlags::ACCEPTS_UNTYPED_DISPATCH) {
            0
        } else {
            opnum as usize
        };
        self.operations
            .get(index)
            .cloned()
            .ok_or(RpcError::OperationOutOfRange {
                opnum,
                count: self.operations.len(),
            })
    }
}

impl fmt::Debug for RegisteredInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredInterface")
            .field("syntax", &self.syntax)
            .field("transfer_syntax", &self.transfer_syntax)
            .field("manager_type", &self.manager_type)
            .field("flags", &self.flags)
            .field("operations", &self.operations.len())
            .finish()
    }
}

type InterfaceKey = (SyntaxId, Uuid);

/// Registered interfaces, shared by every listener of a server.
#[derive(Default)]
pub struct InterfaceRegistry {
    interfaces: RwLock<HashMap<InterfaceKey, Arc<RegisteredInterface>>>,
}

fn lock_error(message: &'static str) -> RpcError {
    RpcError::Protocol(ProtocolError::violation(message))
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an interface. Returns the interface it replaced.
    pub fn register(
        &self,
        interface: RegisteredInterface,
    ) -> Result<Option<Arc<RegisteredInterface>>> {
        let mut interfaces = self
            .interfaces
            .write()
            .map_err(|_| lock_error(constants::ERR_INTERFACE_WRITE_LOCK))?;
        let key = (interface.syntax, interface.manager_type);
        Ok(interfaces.insert(key, Arc::new(interface)))
    }

    pub fn unregister(
        &self,
        syntax: &SyntaxId,
        manager_type: &Uuid,
    ) -> Result<Option<Arc<RegisteredInterface>>> {
        let mut interfaces = self
            .interfaces
            .write()
            .map_err(|_| lock_error(constants::ERR_INTERFACE_WRITE_LOCK))?;
        Ok(interfaces.remove(&(*syntax, *manager_type)))
    }

    /// Exact `(syntax, manager type)` lookup.
    pub fn lookup(
        &self,
        syntax: &SyntaxId,
        manager_type: &Uuid,
    ) -> Result<Option<Arc<RegisteredInterface>>> {
        let interfaces = self
            .interfaces
            .read()
            .map_err(|_| lock_error(constants::ERR_INTERFACE_READ_LOCK))?;
        Ok(interfaces.get(&(*syntax, *manager_type)).cloned())
    }

    /// Decide one presentation context of a bind.
    pub fn negotiate(&self, context: &ContextElement) -> Result<ContextResult> {
        let interfaces = self
            .interfaces
            .read()
            .map_err(|_| lock_error(constants::ERR_INTERFACE_READ_LOCK))?;
        let mut known = false;
        for iface in interfaces
            .values()
            .filter(|iface| iface.syntax == context.abstract_syntax)
        {
            known = true;
            if context.transfer_syntaxes.contains(&iface.transfer_syntax) {
                return Ok(ContextResult::accepted(iface.transfer_syntax));
            }
        }
        Ok(ContextResult::rejected(if known {
            provider_reason::PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED
        } else {
            provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED
        }))
    }

    pub fn len(&self) -> usize {
        self.interfaces.read().map(|i| i.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::syntax::NDR_TRANSFER_SYNTAX;

    fn syntax() -> SyntaxId {
        SyntaxId::new(Uuid::from_u128(0xfeed), 1, 0)
    }

    fn echo() -> RegisteredInterface {
        RegisteredInterface::new(syntax(), NDR_TRANSFER_SYNTAX)
            .with_operation(|msg: &mut Message| Ok(msg.response(msg.as_bytes())))
            .with_operation(|msg: &mut Message| Ok(msg.response(b"second")))
    }

    #[test]
    fn test_opnum_is_bounds_checked() {
        let iface = echo();
        assert!(iface.operation(1).is_ok());
        assert!(matches!(
            iface.operation(2),
            Err(RpcError::OperationOutOfRange { opnum: 2, count: 2 })
        ));
    }

    #[test]
    fn test_untyped_dispatch_routes_to_first_operation() {
        let iface = echo().with_flags(InterfaceFlags::ACCEPTS_UNTYPED_DISPATCH);
        let handler = iface.operation(77).unwrap();
        let mut msg = Message::new(syntax(), NDR_TRANSFER_SYNTAX, 77);
        assert_eq!(handler(&mut msg).unwrap().as_bytes(), b"");
    }

    #[test]
    fn test_lookup_requires_matching_manager_type() {
        let registry = InterfaceRegistry::new();
        let typed = Uuid::from_u128(0xbeef);
        registry.register(echo().with_manager_type(typed)).unwrap();
        assert!(registry.lookup(&syntax(), &typed).unwrap().is_some());
        assert!(registry.lookup(&syntax(), &Uuid::nil()).unwrap().is_none());
    }

    #[test]
    fn test_registration_is_idempotent() {
        let registry = InterfaceRegistry::new();
        assert!(registry.register(echo()).unwrap().is_none());
        assert!(registry.register(echo()).unwrap().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_negotiation_distinguishes_unknown_interface_from_transfer_mismatch() {
        let registry = InterfaceRegistry::new();
        registry.register(echo()).unwrap();

        let accepted = registry
            .negotiate(&ContextElement {
                context_id: 0,
                abstract_syntax: syntax(),
                transfer_syntaxes: vec![NDR_TRANSFER_SYNTAX],
            })
            .unwrap();
        assert!(accepted.is_accepted());

        let other_transfer = SyntaxId::new(Uuid::from_u128(0x64), 1, 0);
        let mismatch = registry
            .negotiate(&ContextElement {
                context_id: 0,
                abstract_syntax: syntax(),
                transfer_syntaxes: vec![other_transfer],
            })
            .unwrap();
        assert_eq!(mismatch.reason, provider_reason::PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED);

        let unknown = registry
            .negotiate(&ContextElement {
                context_id: 0,
                abstract_syntax: other_transfer,
                transfer_syntaxes: vec![NDR_TRANSFER_SYNTAX],
            })
            .unwrap();
        assert_eq!(unknown.reason, provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED);
    }
}
