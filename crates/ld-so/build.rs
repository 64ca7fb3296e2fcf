fn main() {
    // The binary carries its own `_start`; the C runtime's startup objects
    // would collide with it.
    println!("cargo:rustc-link-arg-bins=-nostartfiles");
}
