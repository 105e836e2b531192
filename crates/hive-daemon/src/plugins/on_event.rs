//! Run instance commands when events fire.
//!
//! `ON_EVENT <EVENT_NAME> <command...>` binds `command` to `EVENT_NAME` on the
//! sending instance. When that event later arrives, every `%s` in the command
//! is replaced with the event's raw arguments and the result is sent back to
//! the instance. Registering the same command twice for an event binds it
//! once.

use std::rc::Rc;

use anyhow::Context;
use hive_protocol::split_quoted;
use serde_json::Value;
use tracing::debug;

use crate::export::Export;
use crate::handler::{Callback, EventArgs, EventHandler};
use crate::instance::Instance;
use crate::plugin::PluginSpec;

pub const NAME: &str = "on_event";

const COMMAND: &str = "command";

pub fn spec() -> PluginSpec {
    let send = Callback::new("send", send);

    let parse = {
        let send = send.clone();
        Callback::new("parse_on_event", move |inst, args| {
            let tokens = split_quoted(args.payload().unwrap_or_default());
            let Some((event, command)) = tokens.split_first() else {
                anyhow::bail!("ON_EVENT without an event name");
            };
            if command.is_empty() {
                anyhow::bail!("ON_EVENT {} without a command", event);
            }
            bind(inst, event, &command.join(" "), &send)?;
            Ok(())
        })
    };

    PluginSpec::new(NAME).init(move |ctx| {
        let send = send.clone();
        ctx.export(
            NAME,
            Export::method(move |inst, args| {
                let event = args
                    .first()
                    .and_then(Value::as_str)
                    .context("on_event: missing event name")?;
                let command = args
                    .get(1)
                    .and_then(Value::as_str)
                    .context("on_event: missing command")?;
                let handler = bind(inst, event, command, &send)?;
                Ok(Value::from(handler.id()))
            }),
        )?;
        ctx.connect("ON_EVENT", &parse, EventArgs::new())?;
        Ok(())
    })
}

fn bind(
    inst: &mut Instance,
    event: &str,
    command: &str,
    send: &Callback,
) -> anyhow::Result<Rc<EventHandler>> {
    let plugin = Rc::clone(inst.plugins().require(NAME)?);
    let handler = plugin.connect(
        inst,
        event,
        send,
        EventArgs::new().with_kwarg(COMMAND, command),
    )?;
    Ok(handler)
}

fn send(inst: &mut Instance, args: &EventArgs) -> anyhow::Result<()> {
    let command = args
        .kwargs
        .get(COMMAND)
        .and_then(Value::as_str)
        .context("handler bound without a command")?;
    let expanded = command.replace("%s", args.payload().unwrap_or_default());
    debug!("Sending {:?}", expanded);
    inst.enqueue(&expanded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;
    use crate::plugin::PluginSet;
    use serde_json::json;
    use tokio::net::UnixStream;

    fn started() -> (Instance, UnixStream) {
        let plugins = PluginSet::load(vec![spec()]).unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let mut inst = Instance::new(InstanceId::from(1), ours, Rc::new(plugins));
        inst.dispatch("INSTANCE_START", &EventArgs::from_payload(Some("1"))).unwrap();
        (inst, theirs)
    }

    fn fire(inst: &mut Instance, event: &str, payload: &str) {
        inst.dispatch(event, &EventArgs::from_payload(Some(payload))).unwrap();
    }

    #[tokio::test]
    async fn test_on_event_binds_and_expands() {
        let (mut inst, _peer) = started();
        fire(&mut inst, "ON_EVENT", "load_finish js \"alert('%s')\"");
        assert_eq!(inst.handlers("LOAD_FINISH").len(), 1);

        fire(&mut inst, "LOAD_FINISH", "https://example.org");
        assert_eq!(inst.pending_output(), b"js alert('https://example.org')\n");
    }

    #[tokio::test]
    async fn test_repeated_registration_binds_once() {
        let (mut inst, _peer) = started();
        fire(&mut inst, "ON_EVENT", "KEY_PRESS reload");
        fire(&mut inst, "ON_EVENT", "KEY_PRESS reload");
        fire(&mut inst, "ON_EVENT", "KEY_PRESS stop");
        assert_eq!(inst.handlers("KEY_PRESS").len(), 2);

        fire(&mut inst, "KEY_PRESS", "r");
        assert_eq!(inst.pending_output(), b"reload\nstop\n");
    }

    #[tokio::test]
    async fn test_malformed_registration_binds_nothing() {
        let (mut inst, _peer) = started();
        fire(&mut inst, "ON_EVENT", "LONELY");
        fire(&mut inst, "ON_EVENT", "");
        assert!(inst.handlers("LONELY").is_empty());
    }

    #[tokio::test]
    async fn test_method_export() {
        let (mut inst, _peer) = started();
        let id = inst.call_export(NAME, &[json!("title_changed"), json!("echo %s")]).unwrap();
        let again = inst.call_export(NAME, &[json!("TITLE_CHANGED"), json!("echo %s")]).unwrap();
        assert_eq!(id, again);

        fire(&mut inst, "TITLE_CHANGED", "hi");
        assert_eq!(inst.pending_output(), b"echo hi\n");
    }
}
