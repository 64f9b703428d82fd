//! Cheap shared strings. Labels (provider names, model names, scope keys) are
//! cloned on every request, so they are reference counted rather than owned.

pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_and_new_compare_equal() {
		const L: Strng = literal!("openai");
		assert_eq!(L, new(String::from("openai")));
	}
}
