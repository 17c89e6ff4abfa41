mod dashboard;

use std::io::{self, BufRead, Read, Write};
use std::time::Duration;

use ate_tm::config::Config;
use ate_tm::console::{CommandError, Console};
use ate_tm::executor::TestMethodExecutor;

// The main entry point for the test-method console.
fn main() -> io::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .try_init();

    println!("================================");
    println!("  DC Measurement Test Method    ");
    println!("================================");

    print!("Configuration file (empty for built-in default): ");
    io::stdout().flush()?;
    let path = read_line()?;

    let loaded = match path.trim() {
        "" => Config::parse(&Config::default_toml()),
        path => Config::load(path),
    };
    let config = loaded.unwrap_or_else(|e| {
        eprintln!("[WARNING] {}. Using the built-in default.", e);
        Config::parse(&Config::default_toml()).unwrap_or_default()
    });

    let params = match config.params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return Ok(());
        }
    };
    let mut console = Console::new(config.build_tester(), TestMethodExecutor::new(params));

    println!(
        "Test suite '{}' on {} configured sites, measuring '{}'",
        config.tester.suite, config.tester.sites, config.test_method.pin
    );

    // Main menu loop.
    loop {
        println!("\nSelect mode:");
        println!("  1. Manual Command Input");
        println!("  2. Listen on Serial Port");
        println!("  3. Results Dashboard");
        println!("  4. Exit");
        print!("> ");
        io::stdout().flush()?;

        match read_line()?.trim() {
            "1" => run_manual_mode(&mut console)?,
            "2" => run_serial_mode(&mut console)?,
            "3" => dashboard::run(&mut console)?,
            "4" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, 3 or 4."),
        }
    }
    Ok(())
}

fn read_line() -> io::Result<String> {
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line)
}

// Handles the manual command input mode.
fn run_manual_mode(console: &mut Console) -> io::Result<()> {
    println!("\n--- Manual Mode ---");
    println!("Enter commands such as <RUN>, <BGJ> or <STA>, or type 'back' to return.");
    print!("> ");
    io::stdout().flush()?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let input = line?;
        let command = input.trim();

        if command == "back" {
            break;
        }

        if !command.is_empty() {
            process_and_display_command(console, command);
        }
        print!("> ");
        io::stdout().flush()?;
    }
    Ok(())
}

// Handles the serial port listening mode.
fn run_serial_mode(console: &mut Console) -> io::Result<()> {
    println!("\n--- Serial Mode ---");

    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return Ok(());
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return Ok(());
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }

    print!("Select a port (number): ");
    io::stdout().flush()?;
    let port_index: usize = match read_line()?.trim().parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return Ok(());
        }
    };
    let port_name = &ports[port_index].port_name;

    let baud_rates = [9600, 19200, 38400, 57600, 115200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    print!("Select a baud rate (number): ");
    io::stdout().flush()?;
    let baud_rate = match read_line()?.trim().parse::<usize>() {
        Ok(i) if i < baud_rates.len() => baud_rates[i],
        _ => {
            eprintln!("[ERROR] Invalid baud rate selection.");
            return Ok(());
        }
    };

    let mut port = match serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", port_name, e);
            return Ok(());
        }
    };

    println!(
        "\nListening on {} at {} baud. Press Ctrl+C to exit.",
        port_name, baud_rate
    );

    // Bytes are buffered until a whole '<...>' frame has arrived.
    let mut serial_buf: Vec<u8> = vec![0; 128];
    let mut pending = String::new();
    loop {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) if bytes_read > 0 => {
                pending.push_str(&String::from_utf8_lossy(&serial_buf[..bytes_read]));
                while let Some(end) = pending.find('>') {
                    let frame: String = pending.drain(..=end).collect();
                    let command = frame.trim();
                    if command.is_empty() {
                        continue;
                    }
                    println!("> Received: {}", command);
                    if let Some(response) = process_and_display_command(console, command) {
                        if let Err(e) = port.write_all(response.as_bytes()) {
                            eprintln!("[ERROR] Failed to write to serial port: {}", e);
                        }
                    }
                }
            }
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => eprintln!("[ERROR] Serial port error: {}", e),
        }
    }
}

// Common function to process a command string and print the output.
fn process_and_display_command(console: &mut Console, command: &str) -> Option<String> {
    match console.process_command(command) {
        Ok(Some(response)) => {
            println!("< {}", response);
            Some(response)
        }
        Ok(None) => None,
        Err(e) => {
            match &e {
                CommandError::InvalidFrame => eprintln!(
                    "[ERROR] Invalid command frame. A valid command must be enclosed in '<...>'."
                ),
                CommandError::TooShort => eprintln!("[ERROR] Command is missing arguments."),
                CommandError::UnknownCommand(name) => {
                    eprintln!("[ERROR] Unknown command '{}'.", name)
                }
                CommandError::InvalidNumber(_) | CommandError::InvalidParameter(_) => {
                    eprintln!("[ERROR] {}", e)
                }
                CommandError::TestMethod(inner) => eprintln!("[ERROR] Test method failed: {}", inner),
            }
            None
        }
    }
}
