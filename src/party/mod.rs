pub mod gen12;
pub mod gen3;
pub mod patch;

pub use gen12::{PartySection, SinglePokemon};
pub use gen3::Pokemon3;
