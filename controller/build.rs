fn main() {
    // Only ESP-IDF builds carry the linker arguments esp-idf-sys exports.
    if std::env::var_os("CARGO_FEATURE_ESP32").is_some() {
        embuild::espidf::sysenv::output();
    }
}
