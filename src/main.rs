mod cli {
    use std::env;
    use std::io::{self, BufRead, Write};
    use std::sync::Arc;

    use anyhow::Context;
    use tracing_subscriber::EnvFilter;

    use mixsurface::config::Config;
    use mixsurface::entity::ChannelIdentifier;
    use mixsurface::layers::LayerController;
    use mixsurface::scheduler::Scheduler;
    use mixsurface::session::Session;
    use mixsurface::surface::StatusBoard;
    use mixsurface::transport::{CommandSink, MixrackPort};

    const DEFAULT_CONFIG: &str = "mixsurface.toml";

    const HELP: &str = "\
commands:
  ?      this help
  d      dump the tracked mix state
  r      force a resync
  s<n>   recall scene n (1-based)
  i<n>   select input n (sends on fader)
  o<n>   select output n (mix on faders)
  m      mixing mode
  f      toggle channel filter
  x      toggle sends target (aux/fx)
  l      toggle the S-DCA layer
  q      quit";

    fn channel_argument(
        input: &str,
        channels: &[ChannelIdentifier],
    ) -> Option<ChannelIdentifier> {
        let index: usize = input.parse().ok()?;
        // commands are 1-based like the console UI
        channels.get(index.checked_sub(1)?).copied()
    }

    pub fn run() -> anyhow::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();

        let config_path = env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.into());
        let config = Config::from_file(&config_path)
            .with_context(|| format!("loading {config_path}"))?;

        let status = Arc::new(StatusBoard::new());
        status.on_status().subscribe(|line| println!("[{line}]"));

        // Two connections on purpose: the console does not echo a command
        // back on the connection that issued it.
        status.set_status("Connecting to mixrack…");
        let outbound = Arc::new(MixrackPort::connect(&config.mixrack, Arc::clone(&status))?);
        let inbound = Arc::new(MixrackPort::connect(&config.mixrack, Arc::clone(&status))?);

        if let Some(capacity) = config.timing.rate_limit {
            outbound.enable_rate_limiting(capacity);
        }

        let scheduler = Arc::new(Scheduler::new(2));
        let session = Arc::new(Session::new(
            &config,
            Arc::clone(&outbound) as Arc<dyn CommandSink>,
            Arc::clone(&scheduler),
            Arc::clone(&status),
        )?);

        let controller = LayerController::new(&session);

        session.listen(vec![outbound.reader()?, inbound.reader()?]);

        {
            let session = Arc::clone(&session);
            std::thread::Builder::new()
                .name("sync".into())
                .spawn(move || {
                    if let Err(error) = session.sync() {
                        tracing::error!(%error, "sync failed");
                    }
                })
                .expect("failed to spawn sync thread");
        }

        let stdin = io::stdin();
        print!("> ");
        io::stdout().flush().ok();

        for line in stdin.lock().lines() {
            let line = line?;
            let command = line.trim();

            match command {
                "" => {}
                "?" => println!("{HELP}"),
                "d" => println!("{}", session.dump()),
                "r" => {
                    let session = Arc::clone(&session);
                    std::thread::spawn(move || {
                        if let Err(error) = session.sync() {
                            tracing::error!(%error, "resync failed");
                        }
                    });
                }
                "m" => controller.select_mixing_mode(),
                "f" => controller.toggle_channel_filter(),
                "x" => controller.toggle_sends_target(),
                #[cfg(feature = "s-dca")]
                "l" => controller.toggle_s_dca_mode(),
                "q" => break,
                _ if command.starts_with('s') => match command[1..].parse::<u16>() {
                    Ok(number) if number >= 1 => {
                        if let Err(error) = session.change_scene_number(number - 1) {
                            println!("{error}");
                        }
                    }
                    _ => println!("usage: s<scene number>"),
                },
                _ if command.starts_with('i') => {
                    match channel_argument(&command[1..], session.input_channels()) {
                        Some(channel) => controller.select_input(channel),
                        None => println!("usage: i<input number>"),
                    }
                }
                _ if command.starts_with('o') => {
                    match channel_argument(&command[1..], session.send_channels()) {
                        Some(channel) => controller.select_output(channel),
                        None => println!("usage: o<output number>"),
                    }
                }
                _ => println!("unknown command {command:?} — try ?"),
            }

            print!("> ");
            io::stdout().flush().ok();
        }

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    cli::run()
}
