fn main() {
    if let Err(e) = chat_box_lib::run() {
        eprintln!("chat-box: {}", e);
        std::process::exit(1);
    }
}
