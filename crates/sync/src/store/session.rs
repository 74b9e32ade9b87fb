//! Who is logged in, which group is focused, and sidebar chrome state.

use margin_proto::Profile;
use serde_json::Value;

/// Panel shown over the annotation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
	LoginPrompt,
}

#[derive(Debug)]
pub struct Session {
	profile: Profile,
	focused_group: Option<String>,
	groups: Vec<Value>,
	/// Bumped whenever the group list should be fetched again.
	groups_generation: u64,
	sidebar_opened: bool,
	highlights_visible: bool,
	panel: Option<Panel>,
}

impl Default for Session {
	fn default() -> Self {
		Self {
			profile: Profile::default(),
			focused_group: None,
			groups: Vec::new(),
			groups_generation: 0,
			sidebar_opened: false,
			highlights_visible: true,
			panel: None,
		}
	}
}

impl Session {
	pub(crate) fn update_profile(&mut self, profile: Profile) {
		if self.profile.userid != profile.userid {
			tracing::info!(userid = ?profile.userid, "session user changed");
		}
		self.profile = profile;
	}

	/// Replaces the group list and asks for a refresh.
	pub(crate) fn load_groups(&mut self, groups: Vec<Value>) {
		self.groups = groups;
		self.groups_generation += 1;
	}

	/// Returns true if the focused group changed.
	pub(crate) fn focus_group(&mut self, group: Option<String>) -> bool {
		if self.focused_group == group {
			return false;
		}
		self.focused_group = group;
		true
	}

	pub(crate) fn set_sidebar_opened(&mut self, opened: bool) {
		self.sidebar_opened = opened;
	}

	pub(crate) fn set_highlights_visible(&mut self, visible: bool) {
		self.highlights_visible = visible;
	}

	pub(crate) fn open_panel(&mut self, panel: Panel) {
		self.panel = Some(panel);
	}

	pub(crate) fn close_panel(&mut self) {
		self.panel = None;
	}

	pub fn profile(&self) -> &Profile {
		&self.profile
	}

	pub fn userid(&self) -> Option<&str> {
		self.profile.userid.as_deref()
	}

	pub fn is_logged_in(&self) -> bool {
		self.profile.userid.is_some()
	}

	pub fn focused_group(&self) -> Option<&str> {
		self.focused_group.as_deref()
	}

	pub fn groups(&self) -> &[Value] {
		&self.groups
	}

	pub fn groups_generation(&self) -> u64 {
		self.groups_generation
	}

	pub fn sidebar_opened(&self) -> bool {
		self.sidebar_opened
	}

	pub fn highlights_visible(&self) -> bool {
		self.highlights_visible
	}

	pub fn panel(&self) -> Option<Panel> {
		self.panel
	}
}
