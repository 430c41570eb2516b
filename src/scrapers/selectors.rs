//! Declarative selector tables for upstream page structures.
//!
//! Each plugin exposes one [`SelectorTables`] value; version-specific plugins
//! override individual entries instead of re-implementing extraction logic.

/// Selectors for the login form.
#[derive(Debug, Clone)]
pub struct LoginSelectors {
    pub email: &'static str,
    pub password: &'static str,
    pub submit: &'static str,
    pub error: &'static str,
    /// Present only when a session is authenticated.
    pub logged_in: &'static str,
}

/// Selectors for the process listing and process view pages.
#[derive(Debug, Clone)]
pub struct ProcessSelectors {
    /// Main listing table.
    pub table: &'static str,
    /// Listing rows (header excluded by the parser).
    pub rows: &'static str,
    /// Anchor inside a row carrying the process number and access link.
    pub row_link: &'static str,
    /// Optional unit cell inside a row.
    pub row_unit: &'static str,
    /// Location bar on the process view, whose text reveals the access type.
    pub location_bar: &'static str,
    pub integral_markers: &'static [&'static str],
    pub partial_markers: &'static [&'static str],
    /// Authority cell on the process view.
    pub authority: &'static str,
}

/// Selectors for the document table on the process view.
///
/// The v4 table carries no signatory column; document signers stay unset
/// until an operator supplies them.
#[derive(Debug, Clone)]
pub struct DocumentSelectors {
    pub table: &'static str,
    pub rows: &'static str,
    /// Anchor carrying the 8-digit document number.
    pub number_link: &'static str,
    pub type_cell: &'static str,
    pub date_cell: &'static str,
}

/// The full selector set a plugin operates with.
#[derive(Debug, Clone)]
pub struct SelectorTables {
    pub login: LoginSelectors,
    pub process: ProcessSelectors,
    pub document: DocumentSelectors,
}

/// Defaults shared by the v4 family. Versions override individual fields.
pub const V4_SELECTORS: SelectorTables = SelectorTables {
    login: LoginSelectors {
        email: "#txtEmail",
        password: "#pwdSenha",
        submit: "#sbmLogin",
        error: "#divInfraMsg, .alert-danger",
        logged_in: "#lnkUsuarioSistema, #lnkInfraSair",
    },
    process: ProcessSelectors {
        table: "#tblDocumentos",
        rows: "#tblDocumentos tbody tr",
        row_link: "td[align=\"center\"] a",
        row_unit: "td.colUnidade",
        location_bar: "#divInfraBarraLocalizacao",
        integral_markers: &["Visualização Integral"],
        partial_markers: &["Acesso Parcial", "Visualização Parcial"],
        authority: "#tblDocumentos tbody tr:nth-child(2) td:nth-child(5) a",
    },
    document: DocumentSelectors {
        table: "#tblDocumentos",
        rows: "#tblDocumentos tr.infraTrClara",
        number_link: "td:nth-child(2) a",
        type_cell: "td:nth-child(3)",
        date_cell: "td:nth-child(4)",
    },
};
