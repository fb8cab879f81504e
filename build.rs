fn main() {
    shadow_rs::new().expect("shadow-rs build info generation");
}
