use auth_milter::handlers::HandlerRegistry;
use auth_milter::{run_server, Config};
use clap::{Arg, Command};
use log::LevelFilter;
use std::process;

fn main() {
    let matches = Command::new("auth-milter")
        .version("0.1.0")
        .about("Email authentication milter and SMTP proxy (SPF, DKIM, DMARC, IPrev)")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/auth-milter.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test the configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") || config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(log_level);
    if config.logtoerr {
        builder.target(env_logger::Target::Stderr);
    }
    builder.init();

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    // Fork before the runtime comes up.
    if matches.get_flag("daemon") {
        daemonize();
    }

    log::info!("starting auth-milter");
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run_server(config)) {
        log::error!("server error: {e}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("configuration file {path:?} not found, using defaults");
        Ok(Config::default())
    }
}

fn test_config(config: &Config) {
    if let Err(e) = HandlerRegistry::build(config, config.external_callback_processor.as_hook()) {
        eprintln!("Configuration error: {e}");
        process::exit(1);
    }
    if let Err(e) = auth_milter::ipmap::IpMap::parse(&config.ip_map) {
        eprintln!("Configuration error: {e}");
        process::exit(1);
    }
    println!("Configuration file is valid!");
    println!("Socket path: {}", config.socket_path);
    if let Some(listen) = &config.proxy_listen {
        println!("SMTP proxy: {listen}");
    }
    println!("AuthServID: {}", config.authserv_id());
    println!("Handlers ({}):", config.load_handlers.len());
    for (pos, name) in config.load_handlers.iter().enumerate() {
        println!("  {}. {name}", pos + 1);
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn daemonize() {
    #[cfg(unix)]
    {
        match unsafe { libc::fork() } {
            -1 => {
                eprintln!("Failed to fork process");
                process::exit(1);
            }
            0 => {
                if unsafe { libc::setsid() } == -1 {
                    eprintln!("Failed to create new session");
                    process::exit(1);
                }
                if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
                    log::warn!("failed to change working directory to /");
                }
                unsafe {
                    libc::close(0);
                    libc::close(1);
                    libc::close(2);
                }
            }
            _ => {
                // Parent exits; the child carries on.
                process::exit(0);
            }
        }
    }

    #[cfg(not(unix))]
    {
        log::warn!("daemon mode not supported on this platform, running in foreground");
    }
}
