//! End-to-end tests: a real daemon on a temp-dir socket, driven by clients
//! speaking the line protocol.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hive_daemon::{
    Callback, Daemon, DaemonConfig, DaemonError, EventArgs, Export, PluginCatalog, PluginSet,
    PluginSpec,
};
use hive_protocol::EventCodec;
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type Log = Rc<RefCell<Vec<String>>>;
type Client = Framed<UnixStream, EventCodec>;

fn test_config(dir: &TempDir) -> DaemonConfig {
    DaemonConfig {
        socket_path: dir.path().join("hive.sock"),
        pid_file: Some(dir.path().join("hive.pid")),
        plugins: Vec::new(),
        auto_close: true,
        print_events: false,
        poll_interval_ms: 50,
    }
}

async fn connect(path: &Path) -> Client {
    let stream = UnixStream::connect(path).await.unwrap();
    Framed::new(stream, EventCodec::new())
}

async fn send_lines(client: &mut Client, lines: &[&str]) {
    for line in lines {
        client.send(*line).await.unwrap();
    }
}

async fn next_line(client: &mut Client) -> Option<String> {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for the daemon")
        .map(Result::unwrap)
}

/// Serve `plugins` until the client future is done and the daemon
/// auto-closes.
async fn serve<F, Fut>(plugins: PluginSet, client: F) -> TempDir
where
    F: FnOnce(std::path::PathBuf) -> Fut,
    Fut: Future<Output = ()>,
{
    let dir = TempDir::new().unwrap();
    let mut daemon = Daemon::bind(test_config(&dir), plugins).await.unwrap();
    let client = client(daemon.socket_path().to_path_buf());

    let (served, ()) = tokio::time::timeout(TEST_TIMEOUT, async {
        tokio::join!(daemon.run(), client)
    })
    .await
    .expect("daemon did not stop");
    served.unwrap();

    assert_eq!(daemon.instance_count(), 0);
    drop(daemon);
    dir
}

/// Plugin that logs every hook, and for `ping` owners answers `PING` with
/// `pong <payload>`.
fn logging_plugin(name: &'static str, log: &Log, answers_ping: bool) -> PluginSpec {
    let (on_init, on_after, on_cleanup, on_ping) =
        (Rc::clone(log), Rc::clone(log), Rc::clone(log), Rc::clone(log));

    let pong = Callback::new("pong", move |inst, args| {
        let payload = args.payload().unwrap_or_default().to_string();
        on_ping.borrow_mut().push(format!("ping:{payload}"));
        inst.enqueue(&format!("pong {payload}"));
        Ok(())
    });

    PluginSpec::new(name)
        .init(move |ctx| {
            on_init
                .borrow_mut()
                .push(format!("init:{name} pid={:?}", ctx.instance().pid()));
            if answers_ping {
                ctx.connect("PING", &pong, EventArgs::new())?;
            }
            Ok(())
        })
        .after(move |_| {
            on_after.borrow_mut().push(format!("after:{name}"));
            Ok(())
        })
        .cleanup(move |_| {
            on_cleanup.borrow_mut().push(format!("cleanup:{name}"));
            Ok(())
        })
}

#[tokio::test]
async fn test_start_ping_and_eof_cleanup() {
    let log: Log = Rc::default();
    let plugins = PluginSet::load(vec![
        logging_plugin("first", &log, true),
        logging_plugin("second", &log, false),
    ])
    .unwrap();

    let dir = serve(plugins, |path| async move {
        let mut client = connect(&path).await;
        send_lines(
            &mut client,
            &["EVENT myinst INSTANCE_START 4242", "EVENT myinst PING hello world"],
        )
        .await;
        assert_eq!(next_line(&mut client).await.as_deref(), Some("pong hello world"));
    })
    .await;

    assert_eq!(
        *log.borrow(),
        vec![
            "init:first pid=Some(4242)",
            "init:second pid=Some(4242)",
            "after:first",
            "after:second",
            "ping:hello world",
            "cleanup:first",
            "cleanup:second",
        ]
    );
    assert!(!dir.path().join("hive.sock").exists());
    assert!(!dir.path().join("hive.pid").exists());
}

#[tokio::test]
async fn test_second_start_rejected_instance_kept() {
    let log: Log = Rc::default();
    let plugins = PluginSet::load(vec![logging_plugin("only", &log, true)]).unwrap();

    serve(plugins, |path| async move {
        let mut client = connect(&path).await;
        send_lines(
            &mut client,
            &[
                "EVENT web-7 INSTANCE_START 1",
                "EVENT web-7 INSTANCE_START 2",
                "EVENT web-7 PING still here",
            ],
        )
        .await;
        assert_eq!(next_line(&mut client).await.as_deref(), Some("pong still here"));
    })
    .await;

    let log = log.borrow();
    assert_eq!(log.iter().filter(|l| l.starts_with("init:")).count(), 1);
    assert_eq!(log[0], "init:only pid=Some(1)");
    assert_eq!(log.iter().filter(|l| l.starts_with("cleanup:")).count(), 1);
}

#[tokio::test]
async fn test_export_conflict_keeps_first_export() {
    let log: Log = Rc::default();
    let (alpha_log, beta_log) = (Rc::clone(&log), Rc::clone(&log));

    let alpha = PluginSpec::new("alpha")
        .init(|ctx| {
            ctx.export("shared", Export::value("alpha"))?;
            Ok(())
        })
        .after(move |ctx| {
            let owner = ctx.instance().export_owner("shared").unwrap_or_default();
            let value = ctx.instance().export("shared").and_then(Export::as_value).cloned();
            alpha_log
                .borrow_mut()
                .push(format!("shared owned by {owner}: {value:?}"));
            Ok(())
        });
    let beta = PluginSpec::new("beta").init(move |ctx| {
        match ctx.export("shared", Export::value("beta")) {
            Err(DaemonError::ExportConflict { name, owner }) => {
                beta_log.borrow_mut().push(format!("conflict {name} {owner}"));
            }
            other => beta_log.borrow_mut().push(format!("unexpected {other:?}")),
        }
        Ok(())
    });
    let plugins = PluginSet::load(vec![alpha, beta]).unwrap();

    serve(plugins, |path| async move {
        let mut client = connect(&path).await;
        send_lines(
            &mut client,
            &["EVENT a INSTANCE_START 10", "EVENT a INSTANCE_EXIT"],
        )
        .await;
        assert_eq!(next_line(&mut client).await, None);
    })
    .await;

    assert_eq!(
        *log.borrow(),
        vec![
            "conflict shared alpha",
            "shared owned by alpha: Some(String(\"alpha\"))",
        ]
    );
}

#[tokio::test]
async fn test_non_event_lines_never_dispatched() {
    let seen: Log = Rc::default();
    let sink = Rc::clone(&seen);
    let record = Callback::new("record", move |_, args| {
        sink.borrow_mut()
            .push(args.payload().unwrap_or_default().to_string());
        Ok(())
    });
    let watcher = PluginSpec::new("watcher").init(move |ctx| {
        ctx.connect("HELLO", &record, EventArgs::new())?;
        Ok(())
    });
    let plugins = PluginSet::load(vec![watcher]).unwrap();

    serve(plugins, |path| async move {
        let mut client = connect(&path).await;
        send_lines(
            &mut client,
            &[
                "EVENT x INSTANCE_START 3",
                "HELLO world",
                "event x HELLO lowercase tag",
                "status EVENT x HELLO",
                "EVENT",
                "EVENT x HELLO there",
                "EVENT [x] HELLO bracketed",
            ],
        )
        .await;
    })
    .await;

    assert_eq!(*seen.borrow(), vec!["there", "bracketed"]);
}

#[tokio::test]
async fn test_builtin_plugins_round_trip() {
    let plugins = PluginCatalog::builtin().load(&["config", "on_event"]).unwrap();

    serve(plugins, |path| async move {
        let mut client = connect(&path).await;
        send_lines(
            &mut client,
            &[
                "EVENT web INSTANCE_START 99",
                "EVENT web ON_EVENT CONFIG_CHANGED echo changed %s",
                "EVENT web ON_EVENT LOAD_FINISH \"js alert('%s')\"",
                "EVENT web VARIABLE_SET zoom_level int 2",
                "EVENT web VARIABLE_SET zoom_level int 2",
                "EVENT web LOAD_FINISH https://example.org",
            ],
        )
        .await;
        assert_eq!(
            next_line(&mut client).await.as_deref(),
            Some("echo changed zoom_level 2")
        );
        assert_eq!(
            next_line(&mut client).await.as_deref(),
            Some("js alert('https://example.org')")
        );
    })
    .await;
}

#[tokio::test]
async fn test_unterminated_input_discarded_at_eof() {
    let seen: Log = Rc::default();
    let sink = Rc::clone(&seen);
    let record = Callback::new("record", move |_, args| {
        sink.borrow_mut()
            .push(args.payload().unwrap_or_default().to_string());
        Ok(())
    });
    let watcher = PluginSpec::new("watcher").init(move |ctx| {
        ctx.connect("NOTE", &record, EventArgs::new())?;
        Ok(())
    });
    let plugins = PluginSet::load(vec![watcher]).unwrap();

    serve(plugins, |path| async move {
        use tokio::io::AsyncWriteExt;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"EVENT n INSTANCE_START 5\nEVENT n NOTE kept\nEVENT n NOTE lost")
            .await.unwrap();
    })
    .await;

    assert_eq!(*seen.borrow(), vec!["kept"]);
}
