fn main() {
    let args: Vec<String> = std::env::args().collect();

    // Non-interactive environment check for deployment scripts.
    // Prints every failed prerequisite and exits 0/1.
    if args.iter().any(|a| a == "--check-prerequisites") {
        forum_setup::run_prerequisite_check();
        return;
    }

    forum_setup::run_server();
}
