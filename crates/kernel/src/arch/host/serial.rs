#[cfg(test)]
pub fn _serial(args: core::fmt::Arguments) {
    std::print!("{args}");
}

#[cfg(not(test))]
pub fn _serial(_args: core::fmt::Arguments) {}
