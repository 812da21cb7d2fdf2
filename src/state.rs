use std::collections::HashMap;
use std::sync::RwLock;

use zeroize::Zeroizing;

use crate::crypto::ct_eq;

/// Number of addressable user slots (1..=15; slot 0 is reserved).
const MAX_USERS: u8 = 15;

/// Access settings for a single user slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserAccess {
    /// Maximum privilege level (4 bits; 4 = Administrator).
    pub privilege_limit: u8,
    /// Whether the user can start sessions.
    pub enabled: bool,
    /// Whether IPMI messaging is allowed.
    pub ipmi_messaging: bool,
    /// Whether link authentication is allowed.
    pub link_auth: bool,
    /// Whether callin/callback access is allowed.
    pub callin_callback: bool,
}

/// Access settings for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelAccess {
    /// 0 = Disabled, 1 = PreBoot, 2 = AlwaysAvailable, 3 = Shared.
    pub access_mode: u8,
    /// Whether user-level authentication is enabled.
    pub user_level_auth: bool,
    /// Whether per-message authentication is enabled.
    pub per_msg_auth: bool,
    /// Whether PEF alerting is enabled. Reported inverted on the wire.
    pub alerting_enabled: bool,
    /// Maximum privilege level for the channel (4 bits).
    pub privilege_limit: u8,
}

/// Static channel information, synthesized rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel number.
    pub channel_number: u8,
    /// Channel medium type (0x04 = 802.3 LAN).
    pub channel_medium: u8,
    /// Channel protocol type (0x01 = IPMB-1.0).
    pub channel_protocol: u8,
    /// Session support (0x02 = multi-session).
    pub session_support: u8,
    /// Number of active sessions reported for the channel.
    pub active_sessions: u8,
}

#[derive(Default)]
struct UserSlot {
    name: Vec<u8>,
    password: Zeroizing<Vec<u8>>,
    access: UserAccess,
}

struct Inner {
    users: [UserSlot; MAX_USERS as usize + 1],
    lan_config: HashMap<u8, Vec<u8>>,
    channel_access: [ChannelAccess; 16],
}

/// BMC configuration state: the user slot table, LAN parameter table, and
/// channel access table.
///
/// All methods are safe for concurrent use; byte values are returned by
/// copy, never as views into internal storage. State is in-memory only and
/// re-seeded from configuration on restart.
pub struct BmcState {
    inner: RwLock<Inner>,
}

impl BmcState {
    /// Create a state store seeded with the configured admin identity in
    /// slot 2. Slot 1 is reserved as the null user.
    pub fn new(admin_user: &str, admin_pass: &str) -> Self {
        let mut inner = Inner {
            users: std::array::from_fn(|_| UserSlot::default()),
            lan_config: HashMap::new(),
            channel_access: [ChannelAccess::default(); 16],
        };

        inner.users[2] = UserSlot {
            name: admin_user.as_bytes().to_vec(),
            password: Zeroizing::new(admin_pass.as_bytes().to_vec()),
            access: UserAccess {
                privilege_limit: 4,
                enabled: true,
                ipmi_messaging: true,
                link_auth: true,
                callin_callback: false,
            },
        };

        inner.lan_config = HashMap::from([
            (1, vec![0x97]), // Auth Type Support (read-only)
            (2, vec![0x14, 0x14, 0x14, 0x14, 0x00]), // Auth Type Enables
            (3, vec![0, 0, 0, 0]), // IP Address
            (4, vec![0x01]), // IP Source: static
            (5, vec![0, 0, 0, 0, 0, 0]), // MAC Address
            (6, vec![0, 0, 0, 0]), // Subnet Mask
            (12, vec![0, 0, 0, 0]), // Default Gateway
        ]);

        inner.channel_access[1] = ChannelAccess {
            access_mode: 2, // AlwaysAvailable
            user_level_auth: true,
            per_msg_auth: true,
            alerting_enabled: false,
            privilege_limit: 4, // Administrator
        };

        Self {
            inner: RwLock::new(inner),
        }
    }

    fn valid_user_id(user_id: u8) -> bool {
        (1..=MAX_USERS).contains(&user_id)
    }

    /// The number of user slots (15).
    pub fn max_users(&self) -> u8 {
        MAX_USERS
    }

    /// The name stored in a user slot, or `None` for out-of-range ids.
    pub fn user_name(&self, user_id: u8) -> Option<Vec<u8>> {
        if !Self::valid_user_id(user_id) {
            return None;
        }
        let inner = self.inner.read().expect("state lock");
        Some(inner.users[user_id as usize].name.clone())
    }

    /// Store a user name. Returns `false` for out-of-range ids.
    pub fn set_user_name(&self, user_id: u8, name: &[u8]) -> bool {
        if !Self::valid_user_id(user_id) {
            return false;
        }
        let mut inner = self.inner.write().expect("state lock");
        inner.users[user_id as usize].name = name.to_vec();
        true
    }

    /// A copy of the password stored in a user slot.
    pub fn user_password(&self, user_id: u8) -> Option<Vec<u8>> {
        if !Self::valid_user_id(user_id) {
            return None;
        }
        let inner = self.inner.read().expect("state lock");
        Some(inner.users[user_id as usize].password.to_vec())
    }

    /// Store a user password. Returns `false` for out-of-range ids.
    pub fn set_user_password(&self, user_id: u8, password: &[u8]) -> bool {
        if !Self::valid_user_id(user_id) {
            return false;
        }
        let mut inner = self.inner.write().expect("state lock");
        *inner.users[user_id as usize].password = password.to_vec();
        true
    }

    /// Verify a password in constant time. Empty stored passwords never
    /// match, so unset slots cannot be probed with empty guesses.
    pub fn check_password(&self, user_id: u8, password: &[u8]) -> bool {
        if !Self::valid_user_id(user_id) {
            return false;
        }
        let inner = self.inner.read().expect("state lock");
        let stored = &inner.users[user_id as usize].password;
        if stored.is_empty() {
            return false;
        }
        ct_eq(stored, password)
    }

    /// Access settings for a user slot, or `None` for out-of-range ids.
    pub fn user_access(&self, user_id: u8) -> Option<UserAccess> {
        if !Self::valid_user_id(user_id) {
            return None;
        }
        let inner = self.inner.read().expect("state lock");
        Some(inner.users[user_id as usize].access)
    }

    /// Store access settings for a user slot. Returns `false` for
    /// out-of-range ids.
    pub fn set_user_access(&self, user_id: u8, access: UserAccess) -> bool {
        if !Self::valid_user_id(user_id) {
            return false;
        }
        let mut inner = self.inner.write().expect("state lock");
        inner.users[user_id as usize].access = access;
        true
    }

    /// Number of user slots with the Enabled flag set.
    pub fn enabled_user_count(&self) -> u8 {
        let inner = self.inner.read().expect("state lock");
        inner.users[1..]
            .iter()
            .filter(|slot| slot.access.enabled)
            .count() as u8
    }

    /// Find a user slot by name. Empty names never match.
    pub fn lookup_user_by_name(&self, name: &[u8]) -> Option<u8> {
        if name.is_empty() {
            return None;
        }
        let inner = self.inner.read().expect("state lock");
        inner.users[1..]
            .iter()
            .position(|slot| slot.name == name)
            .map(|i| (i + 1) as u8)
    }

    /// A copy of a LAN configuration parameter value, or `None` when the
    /// parameter has no stored value.
    pub fn lan_config(&self, param: u8) -> Option<Vec<u8>> {
        let inner = self.inner.read().expect("state lock");
        inner.lan_config.get(&param).cloned()
    }

    /// Store a LAN configuration parameter value by copy.
    pub fn set_lan_config(&self, param: u8, data: &[u8]) {
        let mut inner = self.inner.write().expect("state lock");
        inner.lan_config.insert(param, data.to_vec());
    }

    /// Access settings for a channel. Out-of-range channels report the
    /// zero value (Disabled).
    pub fn channel_access(&self, channel: u8) -> ChannelAccess {
        if channel > 15 {
            return ChannelAccess::default();
        }
        let inner = self.inner.read().expect("state lock");
        inner.channel_access[channel as usize]
    }

    /// Store access settings for a channel; out-of-range channels are
    /// ignored.
    pub fn set_channel_access(&self, channel: u8, access: ChannelAccess) {
        if channel > 15 {
            return;
        }
        let mut inner = self.inner.write().expect("state lock");
        inner.channel_access[channel as usize] = access;
    }

    /// Synthesized channel information: every channel reports as 802.3
    /// LAN, IPMB-1.0, multi-session.
    pub fn channel_info(&self, channel: u8) -> ChannelInfo {
        ChannelInfo {
            channel_number: channel,
            channel_medium: 0x04,
            channel_protocol: 0x01,
            session_support: 0x02,
            active_sessions: 0,
        }
    }
}
