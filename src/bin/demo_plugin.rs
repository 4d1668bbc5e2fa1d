//! Demo plugin — one handler per failure mode the engine must survive.
//!
//! Doubles as the integration-test fixture: the tests reach this binary via
//! `CARGO_BIN_EXE_demo_plugin` and point task `command`s at it.

use rowforge::plugin::PluginHost;
use serde_json::{json, Value};

fn row_id(row: &serde_json::Map<String, Value>) -> String {
    row.get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    PluginHost::new()
        // Plain success.
        .handler("stamp", |_row| Ok(json!({ "x": 1 })))
        // Succeeds unless the row id contains "bad".
        .handler("picky", |row| {
            let id = row_id(&row);
            if id.contains("bad") {
                Err(format!("refused row {id:?}"))
            } else {
                Ok(json!({ "ok": true }))
            }
        })
        // Echoes the full field mapping back — shows dependency values.
        .handler("echo", |row| Ok(json!({ "row": Value::Object(row) })))
        // Returns nothing; the engine must persist {} rather than NULL.
        .handler("nothing", |_row| Ok(Value::Null))
        // Always errors.
        .handler("grumpy", |row| Err(format!("grumpy refuses {:?}", row_id(&row))))
        // Panics; the serving loop reports it as an error response.
        .handler("jumpy", |_row| panic!("sprung"))
        // Sleeps past any reasonable test timeout.
        .handler("snooze", |_row| {
            std::thread::sleep(std::time::Duration::from_secs(5));
            Ok(json!({ "slept": true }))
        })
        // Kills the whole worker process mid-request.
        .handler("vanish", |_row| std::process::exit(3))
        .serve()
        .await
}
