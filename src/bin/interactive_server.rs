use std::io::{self, BufRead, Write};
use std::{env, thread};

use validator_server::{
    break_on_err, continue_on_err, mock, DeviceHandle, PollConfig, PollMode, Protocol,
    PushEventReceiver, Result,
};

const MENU: &str = "\
1. Start polling
2. Stop polling
3. Return bill
4. Stack bill
5. Reinitialize
6. Exit";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
        .init();

    let port = env::var("VALIDATOR_PORT").unwrap_or("/dev/ttyS3".into());
    let protocol = env::var("VALIDATOR_PROTOCOL")
        .map(|p| p.parse::<Protocol>())
        .unwrap_or(Ok(Protocol::Jcm))?;

    let (tx, rx) = PushEventReceiver::channel();

    let mut handle = DeviceHandle::new(port.as_str(), mock::demo(protocol), protocol, tx)
        .with_poll_config(PollConfig::default().with_mode(PollMode::Interactive));

    handle.open()?;
    handle.initialize()?;

    thread::spawn(move || loop {
        match rx.0.recv() {
            Ok(event) => println!("> {event}"),
            Err(_) => break,
        }
    });

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        println!("{MENU}");
        print!("Select: ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => break_on_err!(line, "Failed to read input"),
            None => break,
        };

        let choice = continue_on_err!(line.trim().parse::<u8>(), "Invalid selection");

        let res = match choice {
            1 => handle.start_polling(),
            2 => handle.stop_polling(),
            3 => handle.request_return(),
            4 => handle.escrow_stack(),
            5 => handle.reinitialize(),
            6 => break,
            _ => {
                println!("Unknown option: {choice}");
                continue;
            }
        };

        if let Err(err) = res {
            println!("Command failed: {err}");
        }
    }

    if handle.is_polling() {
        handle.stop_polling()?;
    }

    handle.close()
}
