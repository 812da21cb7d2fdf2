//! Command handlers, one per supported (netfn, cmd) pair.
//!
//! Handlers are pure functions over (request data, machine, state); the
//! transports never reach past this dispatch table.

mod app;
mod channel;
mod chassis;
mod lan;
mod user;

use crate::machine::MachineControl;
use crate::session::Ipmi15State;
use crate::state::BmcState;
use crate::types::{CompletionCode, app_cmd, chassis_cmd, netfn, transport_cmd};
use crate::wire::Message;

/// Everything a command handler may consult.
pub(crate) struct CommandContext<'a> {
    pub machine: &'a dyn MachineControl,
    pub state: &'a BmcState,
    pub ipmi15: &'a Ipmi15State,
}

/// Route a request to its handler. Unknown commands and network functions
/// complete with `InvalidCommand`; the session is never torn down over a
/// bad command.
pub(crate) fn dispatch(msg: &Message, ctx: &CommandContext<'_>) -> (CompletionCode, Vec<u8>) {
    let req = msg.data.as_slice();
    match (msg.netfn(), msg.command) {
        (netfn::APP, app_cmd::GET_DEVICE_ID) => app::get_device_id(),
        (netfn::APP, app_cmd::GET_CHANNEL_AUTH_CAPABILITIES) => {
            app::get_channel_auth_capabilities(req)
        }
        (netfn::APP, app_cmd::GET_SESSION_CHALLENGE) => {
            app::get_session_challenge(req, ctx.ipmi15)
        }
        (netfn::APP, app_cmd::ACTIVATE_SESSION) => app::activate_session(req, ctx.ipmi15),
        (netfn::APP, app_cmd::SET_SESSION_PRIVILEGE) => app::set_session_privilege(req),
        (netfn::APP, app_cmd::CLOSE_SESSION) => app::close_session(),
        (netfn::APP, app_cmd::SET_CHANNEL_ACCESS) => channel::set_channel_access(req, ctx.state),
        (netfn::APP, app_cmd::GET_CHANNEL_ACCESS) => channel::get_channel_access(req, ctx.state),
        (netfn::APP, app_cmd::GET_CHANNEL_INFO) => channel::get_channel_info(req, ctx.state),
        (netfn::APP, app_cmd::SET_USER_ACCESS) => user::set_user_access(req, ctx.state),
        (netfn::APP, app_cmd::GET_USER_ACCESS) => user::get_user_access(req, ctx.state),
        (netfn::APP, app_cmd::SET_USER_NAME) => user::set_user_name(req, ctx.state),
        (netfn::APP, app_cmd::GET_USER_NAME) => user::get_user_name(req, ctx.state),
        (netfn::APP, app_cmd::SET_USER_PASSWORD) => user::set_user_password(req, ctx.state),
        (netfn::CHASSIS, chassis_cmd::GET_CHASSIS_STATUS) => {
            chassis::get_chassis_status(ctx.machine)
        }
        (netfn::CHASSIS, chassis_cmd::CHASSIS_CONTROL) => {
            chassis::chassis_control(req, ctx.machine)
        }
        (netfn::CHASSIS, chassis_cmd::CHASSIS_IDENTIFY) => chassis::chassis_identify(),
        (netfn::CHASSIS, chassis_cmd::SET_BOOT_OPTIONS) => {
            chassis::set_boot_options(req, ctx.machine)
        }
        (netfn::CHASSIS, chassis_cmd::GET_BOOT_OPTIONS) => {
            chassis::get_boot_options(req, ctx.machine)
        }
        (netfn::TRANSPORT, transport_cmd::SET_LAN_CONFIG_PARAMS) => {
            lan::set_lan_config_params(req, ctx.state)
        }
        (netfn::TRANSPORT, transport_cmd::GET_LAN_CONFIG_PARAMS) => {
            lan::get_lan_config_params(req, ctx.state)
        }
        _ => (CompletionCode::InvalidCommand, Vec::new()),
    }
}
