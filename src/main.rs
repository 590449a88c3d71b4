//! `gvsp-receiver` entry point

fn main() {
    if let Err(e) = gvsp_receiver_lib::run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
