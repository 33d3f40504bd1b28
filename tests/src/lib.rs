//! Cross-module scenarios. Everything lives under `#[cfg(test)]`.

#[cfg(test)]
mod unit;
