use teleproxy::{args, operate::stream::StreamConnector, AppFriend, Async};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7878".to_owned());

    let app = AppFriend::new(StreamConnector::connect_tcp(addr.as_str())?);
    println!("connected to {addr}");

    let calculator = app.construct("Demo.Calculator", &args![40])?;
    let total = calculator.operation("Add").call(&args![1, 1])?;
    println!("total: {}", total.value::<i64>()?);

    let operand = app.declare_value(&100)?;
    let max = app
        .static_operation("Demo.Calculator.Max")?
        .call(&args![3, &operand, 7])?;
    println!("max: {}", max.value::<i64>()?);

    let token = Async::new();
    let square = calculator
        .operation("SlowSquare")
        .with_async(&token)?
        .call(&[])?;
    print!("waiting");
    while !token.is_completed()? {
        print!(".");
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    println!();
    match token.executing_exception()? {
        Some(exception) => println!("square failed: {exception}"),
        None => println!("square: {}", square.value::<i64>()?),
    }

    if let Err(err) = calculator.get("Missing") {
        println!("expected failure: {err}");
    }

    let point = app.declare_value(&serde_json::json!({ "x": 1, "y": 2 }))?;
    point.set("x", 10)?;
    println!("point: {}", point.to_remote_string()?);

    Ok(())
}
