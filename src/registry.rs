//! Process-wide tables of protocols and, per protocol, named socket
//! kinds, actions, thread roles and connection states.
//!
//! The original engine kept these as process-global singletons returned
//! by a `get_map()`/`get_table()` pair per descriptor kind, each
//! descriptor self-registering into both on construction. A global
//! singleton doesn't fit a library that may host more than one engine
//! in a process (tests build many), so this keeps the same
//! name-keyed-map-plus-id-indexed-table shape but as a value built once
//! via `ProtocolRegistryBuilder` and then frozen behind an `Arc` for the
//! engine's lifetime — registration occurs once at startup, lookups by
//! integer id are O(1) table indexing thereafter.

use std::sync::Arc;

use indexmap::IndexMap;

/// Socket-kind capability flags. A socket kind may combine more than
/// one, e.g. a Unix-domain listener is `unix_ipc | tcp_listen`-shaped
/// but plain TCP listeners just set `TCP_LISTEN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketFlags(u32);

impl SocketFlags {
    pub const TCP_LISTEN: SocketFlags = SocketFlags(1 << 0);
    pub const TCP_CONNECTION: SocketFlags = SocketFlags(1 << 1);
    pub const UNIX_IPC: SocketFlags = SocketFlags(1 << 2);
    pub const TLS: SocketFlags = SocketFlags(1 << 3);

    pub fn empty() -> SocketFlags {
        SocketFlags(0)
    }

    pub fn contains(self, other: SocketFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SocketFlags {
    type Output = SocketFlags;
    fn bitor(self, rhs: SocketFlags) -> SocketFlags {
        SocketFlags(self.0 | rhs.0)
    }
}

/// A bitmap of thread roles a `ProtocolThread` may carry; used both to
/// describe a thread's own capabilities and to express the `role_mask`
/// a message or fd must be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleMask(u32);

impl RoleMask {
    pub fn empty() -> RoleMask {
        RoleMask(0)
    }

    pub fn single(bit: u32) -> RoleMask {
        RoleMask(1 << bit)
    }

    pub fn contains(self, other: RoleMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: RoleMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for RoleMask {
    type Output = RoleMask;
    fn bitor(self, rhs: RoleMask) -> RoleMask {
        RoleMask(self.0 | rhs.0)
    }
}

pub type ActionId = u32;
pub type StateId = u32;
pub type RoleId = u32;
pub type SocketKindId = u32;
pub type ProtocolId = u32;

pub struct SocketKindDescriptor {
    pub name: String,
    pub flags: SocketFlags,
}

pub struct ActionDescriptor<Ctx> {
    pub name: String,
    pub callback: Arc<dyn Fn(&mut Ctx) + Send + Sync>,
}

pub struct StateDescriptor<Ctx> {
    pub name: String,
    pub callback: Arc<dyn Fn(&mut Ctx) + Send + Sync>,
}

pub struct RoleDescriptor {
    pub name: String,
    pub bitmap: RoleMask,
}

/// An immutable, id-indexed protocol descriptor: one per registered
/// protocol (e.g. "http").
pub struct Protocol<Ctx> {
    pub id: ProtocolId,
    pub name: String,
    socket_kinds: Vec<SocketKindDescriptor>,
    socket_kind_names: IndexMap<String, SocketKindId>,
    actions: Vec<ActionDescriptor<Ctx>>,
    action_names: IndexMap<String, ActionId>,
    states: Vec<StateDescriptor<Ctx>>,
    state_names: IndexMap<String, StateId>,
    roles: Vec<RoleDescriptor>,
    role_names: IndexMap<String, RoleId>,
}

impl<Ctx> Protocol<Ctx> {
    pub fn socket_kind(&self, id: SocketKindId) -> &SocketKindDescriptor {
        &self.socket_kinds[id as usize]
    }

    pub fn socket_kind_id(&self, name: &str) -> Option<SocketKindId> {
        self.socket_kind_names.get(name).copied()
    }

    pub fn action(&self, id: ActionId) -> &ActionDescriptor<Ctx> {
        &self.actions[id as usize]
    }

    pub fn action_id(&self, name: &str) -> Option<ActionId> {
        self.action_names.get(name).copied()
    }

    pub fn state(&self, id: StateId) -> &StateDescriptor<Ctx> {
        &self.states[id as usize]
    }

    pub fn state_id(&self, name: &str) -> Option<StateId> {
        self.state_names.get(name).copied()
    }

    pub fn role(&self, id: RoleId) -> &RoleDescriptor {
        &self.roles[id as usize]
    }

    pub fn role_id(&self, name: &str) -> Option<RoleId> {
        self.role_names.get(name).copied()
    }
}

/// Builds one `Protocol<Ctx>`. Each `register_*` call appends to both
/// the name map and the id table in lockstep, mirroring the teacher's
/// map-insert + table-push-back pair on every descriptor constructor.
pub struct ProtocolBuilder<Ctx> {
    id: ProtocolId,
    name: String,
    socket_kinds: Vec<SocketKindDescriptor>,
    socket_kind_names: IndexMap<String, SocketKindId>,
    actions: Vec<ActionDescriptor<Ctx>>,
    action_names: IndexMap<String, ActionId>,
    states: Vec<StateDescriptor<Ctx>>,
    state_names: IndexMap<String, StateId>,
    roles: Vec<RoleDescriptor>,
    role_names: IndexMap<String, RoleId>,
}

impl<Ctx> ProtocolBuilder<Ctx> {
    pub fn new(id: ProtocolId, name: impl Into<String>) -> ProtocolBuilder<Ctx> {
        ProtocolBuilder {
            id,
            name: name.into(),
            socket_kinds: Vec::new(),
            socket_kind_names: IndexMap::new(),
            actions: Vec::new(),
            action_names: IndexMap::new(),
            states: Vec::new(),
            state_names: IndexMap::new(),
            roles: Vec::new(),
            role_names: IndexMap::new(),
        }
    }

    pub fn register_socket_kind(&mut self, name: impl Into<String>, flags: SocketFlags) -> SocketKindId {
        let name = name.into();
        let id = self.socket_kinds.len() as SocketKindId;
        self.socket_kind_names.insert(name.clone(), id);
        self.socket_kinds.push(SocketKindDescriptor { name, flags });
        log::debug!("protocol_sock registered id={} proto={} flags=0x{:08x}", id, self.name, flags.0);
        id
    }

    pub fn register_action<F>(&mut self, name: impl Into<String>, callback: F) -> ActionId
    where
        F: Fn(&mut Ctx) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = self.actions.len() as ActionId;
        self.action_names.insert(name.clone(), id);
        self.actions.push(ActionDescriptor {
            name,
            callback: Arc::new(callback),
        });
        log::debug!("protocol_action registered id={} proto={}", id, self.name);
        id
    }

    pub fn register_state<F>(&mut self, name: impl Into<String>, callback: F) -> StateId
    where
        F: Fn(&mut Ctx) + Send + Sync + 'static,
    {
        let name = name.into();
        let id = self.states.len() as StateId;
        self.state_names.insert(name.clone(), id);
        self.states.push(StateDescriptor {
            name,
            callback: Arc::new(callback),
        });
        log::debug!("protocol_state registered id={} proto={}", id, self.name);
        id
    }

    pub fn register_role(&mut self, name: impl Into<String>, bitmap: RoleMask) -> RoleId {
        let name = name.into();
        let id = self.roles.len() as RoleId;
        self.role_names.insert(name.clone(), id);
        self.roles.push(RoleDescriptor { name, bitmap });
        log::debug!("protocol_mask registered id={} proto={}", id, self.name);
        id
    }

    pub fn build(self) -> Protocol<Ctx> {
        Protocol {
            id: self.id,
            name: self.name,
            socket_kinds: self.socket_kinds,
            socket_kind_names: self.socket_kind_names,
            actions: self.actions,
            action_names: self.action_names,
            states: self.states,
            state_names: self.state_names,
            roles: self.roles,
            role_names: self.role_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_in_lockstep() {
        let mut builder: ProtocolBuilder<()> = ProtocolBuilder::new(0, "http");
        let listen = builder.register_socket_kind("listen", SocketFlags::TCP_LISTEN);
        let conn = builder.register_socket_kind("connection", SocketFlags::TCP_CONNECTION | SocketFlags::TLS);
        let proto = builder.build();

        assert_eq!(proto.socket_kind_id("listen"), Some(listen));
        assert_eq!(proto.socket_kind_id("connection"), Some(conn));
        assert!(proto.socket_kind(conn).flags.contains(SocketFlags::TLS));
        assert_eq!(proto.socket_kind_id("missing"), None);
    }

    #[test]
    fn action_callback_invokes() {
        let mut builder: ProtocolBuilder<i32> = ProtocolBuilder::new(0, "http");
        let id = builder.register_action("increment", |ctx: &mut i32| *ctx += 1);
        let proto = builder.build();

        let mut ctx = 0;
        (proto.action(id).callback)(&mut ctx);
        assert_eq!(ctx, 1);
    }
}
