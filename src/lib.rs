pub mod config;
pub mod device;
pub mod errors;
pub mod models;
pub mod trainers;

// Re-export common types
pub use config::TrainingConfig;
pub use errors::TrainerError;
pub use trainers::pivotal::{PivotalTrainer, TrainingSession};

pub mod logging {
    use log::LevelFilter;
    use env_logger::Builder;
    use std::io::Write;

    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .init();
    }
}
