use serde::{Deserialize, Deserializer};

/// Serde yaml represents things different than just as "JSON in YAML format".
/// We don't want this. Instead, we transcode YAML via the JSON module.
pub mod yamlviajson {
	use serde::de;

	pub fn from_str<T>(s: &str) -> anyhow::Result<T>
	where
		T: for<'de> de::Deserialize<'de>,
	{
		let de_yaml = serde_yaml::Deserializer::from_str(s);
		let mut buf = Vec::with_capacity(128);
		{
			let mut se_json = serde_json::Serializer::new(&mut buf);
			serde_transcode::transcode(de_yaml, &mut se_json)?;
		}
		let mut de_json = serde_json::Deserializer::from_slice(&buf);
		Ok(serde_path_to_error::deserialize(&mut de_json)?)
	}

	/// Parse a YAML document into a JSON value tree, for overlay merging before
	/// the typed decode.
	pub fn to_value(s: &str) -> anyhow::Result<serde_json::Value> {
		from_str(s)
	}
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

/// Limit fields accept either a plain unsigned integer or a string with
/// underscore digit separators (`1_000_000`), which YAML 1.2 lexes as a string.
pub fn de_u64_separators<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Num(u64),
		Str(String),
	}
	match Raw::deserialize(deserializer)? {
		Raw::Num(n) => Ok(n),
		Raw::Str(s) => s
			.replace('_', "")
			.parse::<u64>()
			.map_err(serde::de::Error::custom),
	}
}

pub fn de_u64_separators_option<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum Raw {
		Num(u64),
		Str(String),
	}
	match Option::<Raw>::deserialize(deserializer)? {
		None => Ok(None),
		Some(Raw::Num(n)) => Ok(Some(n)),
		Some(Raw::Str(s)) => s
			.replace('_', "")
			.parse::<u64>()
			.map(Some)
			.map_err(serde::de::Error::custom),
	}
}
