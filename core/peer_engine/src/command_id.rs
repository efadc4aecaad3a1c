//! Identifiers of the commands handled by the service node
//!
//! The engine routes packages by id only and never interprets them; these
//! values are shared with the service node so both sides agree on them.

use std::fmt;

/// Command ids understood by the service node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum ServerCommandId {
    Register = 0x80000,
    Unregister = 0x80001,

    SendRoomMessage = 0x80010,
    SendPrivateMessage = 0x80011,

    GetUserOpenKeyRequest = 0x80020,

    CreateRoom = 0x80030,
    DeleteRoom = 0x80031,
    InviteUsers = 0x80032,
    KickUsers = 0x80033,
    ExitFromRoom = 0x80034,
    RefreshRoom = 0x80035,
    SetRoomAdmin = 0x80036,

    PingRequest = 0x80040,

    AddFileToRoom = 0x80050,
    RemoveFileFromRoom = 0x80051,

    P2PConnectRequest = 0x80060,
    P2PReadyAccept = 0x80061,

    Empty = 0x87FFF,
}

impl ServerCommandId {
    const ALL: [ServerCommandId; 18] = [
        ServerCommandId::Register,
        ServerCommandId::Unregister,
        ServerCommandId::SendRoomMessage,
        ServerCommandId::SendPrivateMessage,
        ServerCommandId::GetUserOpenKeyRequest,
        ServerCommandId::CreateRoom,
        ServerCommandId::DeleteRoom,
        ServerCommandId::InviteUsers,
        ServerCommandId::KickUsers,
        ServerCommandId::ExitFromRoom,
        ServerCommandId::RefreshRoom,
        ServerCommandId::SetRoomAdmin,
        ServerCommandId::PingRequest,
        ServerCommandId::AddFileToRoom,
        ServerCommandId::RemoveFileFromRoom,
        ServerCommandId::P2PConnectRequest,
        ServerCommandId::P2PReadyAccept,
        ServerCommandId::Empty,
    ];

    /// Wire value carried in [`Package::id`](crate::package::Package)
    pub fn id(self) -> u64 {
        self as u64
    }

    pub fn from_id(id: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }
}

impl From<ServerCommandId> for u64 {
    fn from(id: ServerCommandId) -> Self {
        id.id()
    }
}

impl fmt::Display for ServerCommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:X})", self, self.id())
    }
}
