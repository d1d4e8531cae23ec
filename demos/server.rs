use std::{pin::pin, time::Duration};

use async_net::TcpListener;
use futures::{channel::oneshot, task::LocalSpawnExt, FutureExt, StreamExt};
use serde_json::{json, Value};
use teleproxy::operate::{
    local::{LocalExecutor, TypeDef},
    stream::{listen, serve_connection},
};

fn executor() -> LocalExecutor {
    let executor = LocalExecutor::new();
    executor.register_type(
        TypeDef::new("Demo.Calculator")
            .constructor(|args| Ok(json!({ "total": args.first().cloned().unwrap_or(json!(0)) })))
            .operation("Add", |value, args| {
                let total = value["total"].as_i64().unwrap_or_default()
                    + args.iter().filter_map(Value::as_i64).sum::<i64>();
                value["total"] = json!(total);
                Ok(json!(total))
            })
            .operation("SlowSquare", |value, _| {
                std::thread::sleep(Duration::from_millis(500));
                let total = value["total"].as_i64().unwrap_or_default();
                Ok(json!(total * total))
            })
            .static_operation("Max", |args| {
                Ok(args
                    .iter()
                    .filter_map(Value::as_i64)
                    .max()
                    .map_or(Value::Null, Value::from))
            }),
    );
    executor
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_owned());

    let mut exec = futures::executor::LocalPool::new();
    let spawn = exec.spawner();

    exec.run_until(async {
        let listener = TcpListener::bind(addr.as_str()).await?;
        println!("listening on {}", listener.local_addr()?);

        let (stop, stopped) = oneshot::channel::<()>();
        let stopped = stopped.map(drop).shared();

        let join_main = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(60));
            let _ = stop.send(());
        });

        let executor = executor();
        let mut conn_stream = pin!(listen(listener, stopped.clone()));
        while let Some(stream) = conn_stream.next().await {
            let (stream, addr) = stream?;
            println!("connection from {addr}");
            if let Err(e) = spawn.spawn_local({
                let executor = executor.clone();
                let stopped = stopped.clone();
                async move {
                    if let Err(e) = serve_connection(stream.clone(), stream, executor, stopped).await {
                        eprintln!("Connection failed: {e}");
                    }
                }
            }) {
                eprintln!("Error while spawning connection handler: {e}");
            }
        }

        join_main
            .join()
            .map_err(|_err| "Unable to join main thread".to_owned())?;

        Ok::<_, Box<dyn std::error::Error>>(())
    })?;

    exec.run();

    Ok(())
}
