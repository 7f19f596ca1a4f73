use hakobi::{ChannelHandler, DsnExtension, MemoryStorage, SizeExtension, SmtpLimits, SmtpServer};
use std::env;
use std::sync::{Arc, mpsc};
use std::thread;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = env::args().collect();

    let addr = if args.len() > 1 {
        args[1].as_str()
    } else {
        "127.0.0.1:2525"
    };

    let hostname = if args.len() > 2 {
        args[2].as_str()
    } else {
        "hakobi.local"
    };

    info!(addr, hostname, "starting Hakobi SMTP server");

    let (tx, rx) = mpsc::channel::<hakobi::MailTx>();
    let (bounce_tx, bounce_rx) = mpsc::channel::<hakobi::MailTx>();

    let mut server = SmtpServer::new(
        hostname,
        Arc::new(ChannelHandler::new(tx).with_bounces(bounce_tx)),
        Arc::new(MemoryStorage::new()),
    )
    .with_extension(DsnExtension)
    .with_extension(SizeExtension::new(SmtpLimits::MAX_DATA_SIZE));
    for domain in args.iter().skip(3) {
        server = server.with_local_domain(domain);
    }

    thread::spawn(move || {
        let mut count = 0;
        while let Ok(mail) = rx.recv() {
            count += 1;
            info!(
                count,
                id = mail.id,
                from = %mail.from,
                to = ?mail.recipients,
                size = mail.data.len(),
                "delivered"
            );
        }
    });

    thread::spawn(move || {
        while let Ok(mail) = bounce_rx.recv() {
            info!(id = mail.id, from = %mail.from, to = ?mail.recipients, "bounced");
        }
    });

    if let Err(e) = server.start(addr) {
        error!(error = %e, "failed to start server");
        std::process::exit(1);
    }
}
