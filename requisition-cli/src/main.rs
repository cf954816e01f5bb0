mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;

use requisition_core::{
    import_legacy_requisitions, import_legacy_users, AuthService, BackupKind, BackupService,
    LifecycleEngine, LineItem, LogNotifier, LoginOutcome, PermissionTable, Requisition,
    RequisitionStore, Role, SequenceAllocator, Session, User, UserStore,
};

use crate::cli::{BackupCommand, Cli, Command, ImportCommand, UserCommand};

struct Portal {
    requisitions: RequisitionStore,
    users: UserStore,
    permissions: PermissionTable,
    allocator: SequenceAllocator,
    backups: BackupService,
}

impl Portal {
    fn open(data_dir: &Path) -> Result<Self> {
        let profiles = data_dir.join("profiles.json");
        let sequence = data_dir.join("sequence.json");

        Ok(Self {
            requisitions: RequisitionStore::open(data_dir.join("requisitions.db"))?,
            users: UserStore::open(data_dir.join("users.db"))?,
            permissions: PermissionTable::load_or_seed(&profiles)?,
            allocator: SequenceAllocator::new(&sequence)?,
            backups: BackupService::new(data_dir.join("backups"), profiles, sequence)?,
        })
    }

    fn engine(&self) -> LifecycleEngine<'_> {
        LifecycleEngine::new(
            &self.requisitions,
            &self.allocator,
            &self.permissions,
            &LogNotifier,
        )
    }

    fn auth(&self) -> AuthService<'_> {
        AuthService::new(&self.users, &self.permissions)
    }

    fn session(&self, user: Option<&str>) -> Result<Session> {
        let name = user.context("this command needs --user")?;
        let user = self
            .users
            .get(name)?
            .with_context(|| format!("unknown user: {}", name))?;
        if !user.active {
            bail!("account {} is deactivated", user.name);
        }
        Ok(Session::new(&user.name, user.role))
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let portal = Portal::open(&cli.data_dir)?;

    match &cli.command {
        Command::Init { admin, email } => {
            init_portal(&portal, admin, email)?;
        }
        Command::Login { name, password } => {
            match portal.auth().authenticate(name, password)? {
                LoginOutcome::Authenticated(session) => {
                    println!("authenticated as {} ({})", session.user, session.role);
                }
                LoginOutcome::PasswordSetupRequired => {
                    println!("no password set yet; use `reqs user set-password`");
                }
            }
        }
        Command::User(user_cmd) => {
            handle_user_command(&portal, user_cmd, cli.user.as_deref())?;
        }
        Command::Create {
            client,
            items,
            notes,
        } => {
            let session = portal.session(cli.user.as_deref())?;
            let items = items
                .iter()
                .map(|spec| parse_item(spec))
                .collect::<Result<Vec<_>>>()?;
            let req = portal.engine().create(&session, client, items, notes)?;
            println!("created requisition {}", req.number);
        }
        Command::Accept { number } => {
            let session = portal.session(cli.user.as_deref())?;
            let req = portal.engine().accept(&session, *number)?;
            println!("requisition {} accepted by {}", req.number, session.user);
        }
        Command::Quote {
            number,
            line,
            unit_cost,
            markup,
            delivery,
        } => {
            let session = portal.session(cli.user.as_deref())?;
            let req = portal
                .engine()
                .quote_item(&session, *number, *line, *unit_cost, *markup, delivery)?;
            let item = req
                .items
                .iter()
                .find(|i| i.line_no == *line)
                .context("quoted line vanished")?;
            println!(
                "line {} quoted: unit price {:.2}, total {:.2}",
                line,
                item.unit_price.unwrap_or_default(),
                item.line_total.unwrap_or_default()
            );
        }
        Command::Finalize { number } => {
            let session = portal.session(cli.user.as_deref())?;
            portal.engine().finalize(&session, *number)?;
            println!("requisition {} finalized", number);
        }
        Command::Refuse { number, reason } => {
            let session = portal.session(cli.user.as_deref())?;
            portal.engine().refuse(&session, *number, reason)?;
            println!("requisition {} refused", number);
        }
        Command::List { all } => {
            let session = portal.session(cli.user.as_deref())?;
            let visible = portal.engine().visible_requisitions(&session, *all)?;
            print_requisition_table(&visible);
        }
        Command::Show { number } => {
            let req = portal
                .requisitions
                .get(*number)?
                .with_context(|| format!("requisition {} not found", number))?;
            print_requisition(&req);
        }
        Command::Stats => {
            let summary = portal.engine().status_summary()?;
            println!("open:        {}", summary.open);
            println!("in progress: {}", summary.in_progress);
            println!("finalized:   {}", summary.finalized);
            println!("refused:     {}", summary.refused);
            println!("total:       {}", summary.total());
        }
        Command::Import(import_cmd) => {
            handle_import_command(&portal, import_cmd, cli.user.as_deref())?;
        }
        Command::Backup(backup_cmd) => {
            handle_backup_command(&portal, backup_cmd)?;
        }
    }

    Ok(())
}

fn init_portal(portal: &Portal, admin: &str, email: &str) -> Result<()> {
    if portal.users.count()? > 0 {
        bail!("data directory is already initialized");
    }

    // Bootstrap: the first admin is written directly, there is no one to
    // authorize the registration yet.
    let user = User::new(admin, email.trim().to_lowercase(), Role::Admin);
    portal.users.save(&user)?;
    println!(
        "initialized; admin {} must set a password on first login",
        user.name
    );
    Ok(())
}

fn handle_user_command(portal: &Portal, cmd: &UserCommand, acting: Option<&str>) -> Result<()> {
    let auth = portal.auth();
    match cmd {
        UserCommand::Add { name, email, role } => {
            let session = portal.session(acting)?;
            let role = Role::parse(role).with_context(|| format!("unknown role: {}", role))?;
            let user = auth.register(&session, name, email, role)?;
            println!("registered {} as {}", user.name, user.role);
        }
        UserCommand::List => {
            let session = portal.session(acting)?;
            for user in auth.list(&session)? {
                let state = if user.active { "active" } else { "inactive" };
                println!("{:<30} {:<8} {:<8} {}", user.name, user.role, state, user.email);
            }
        }
        UserCommand::SetPassword { name, password } => {
            let session = match acting {
                Some(_) => Some(portal.session(acting)?),
                None => None,
            };
            auth.set_password(session.as_ref(), name, password)?;
            println!("password set for {}", name.to_uppercase());
        }
        UserCommand::Deactivate { name } => {
            let session = portal.session(acting)?;
            auth.deactivate(&session, name)?;
            println!("deactivated {}", name.to_uppercase());
        }
        UserCommand::Remove { name } => {
            let session = portal.session(acting)?;
            auth.delete(&session, name)?;
            println!("deleted {}", name.to_uppercase());
        }
    }
    Ok(())
}

fn handle_import_command(portal: &Portal, cmd: &ImportCommand, acting: Option<&str>) -> Result<()> {
    let session = portal.session(acting)?;
    if !portal.permissions.get(session.role).import {
        bail!("{} may not import data", session.role);
    }

    match cmd {
        ImportCommand::Requisitions { path } => {
            let count = import_legacy_requisitions(path, &portal.requisitions, &portal.allocator)?;
            println!("imported {} requisitions", count);
        }
        ImportCommand::Users { path } => {
            let count = import_legacy_users(path, &portal.users)?;
            println!("imported {} users", count);
        }
    }
    Ok(())
}

fn handle_backup_command(portal: &Portal, cmd: &BackupCommand) -> Result<()> {
    match cmd {
        BackupCommand::Run { auto } => {
            let kind = if *auto {
                BackupKind::Auto
            } else {
                BackupKind::Manual
            };
            let archive = portal
                .backups
                .run_backup(kind, &portal.requisitions, &portal.users)?;
            println!("backup written to {}", archive.display());
        }
        BackupCommand::Daily { watch } => match watch {
            // Timer mode for running under a service manager.
            Some(secs) => loop {
                match portal
                    .backups
                    .run_daily(&portal.requisitions, &portal.users)
                {
                    Ok(Some(path)) => println!("daily backup written to {}", path.display()),
                    Ok(None) => {}
                    Err(e) => eprintln!("daily backup failed: {}", e),
                }
                std::thread::sleep(std::time::Duration::from_secs(*secs));
            },
            None => {
                match portal
                    .backups
                    .run_daily(&portal.requisitions, &portal.users)?
                {
                    Some(path) => println!("daily backup written to {}", path.display()),
                    None => println!("today's backup already exists"),
                }
            }
        },
        BackupCommand::List => {
            for archive in portal.backups.list_backups()? {
                println!("{}", archive.display());
            }
        }
        BackupCommand::Prune { days } => {
            let removed = portal.backups.prune(*days)?;
            println!("removed {} expired archives", removed);
        }
        BackupCommand::Restore { archive } => {
            portal.backups.restore(
                archive,
                &portal.requisitions,
                &portal.users,
                &portal.allocator,
            )?;
            println!("restored from {}", archive.display());
        }
    }
    Ok(())
}

/// Parses a DESCRIPTION:QUANTITY item spec
fn parse_item(spec: &str) -> Result<LineItem> {
    let (description, quantity) = spec
        .rsplit_once(':')
        .with_context(|| format!("item must be DESCRIPTION:QUANTITY, got {:?}", spec))?;
    let quantity: f64 = quantity
        .trim()
        .parse()
        .with_context(|| format!("bad quantity in item {:?}", spec))?;
    Ok(LineItem::new(description.trim().to_uppercase(), quantity))
}

fn print_requisition_table(requisitions: &[Requisition]) {
    println!(
        "{:<8} {:<12} {:<20} {:<20} {:>5}",
        "NUMBER", "STATUS", "CLIENT", "SELLER", "ITEMS"
    );
    for req in requisitions {
        println!(
            "{:<8} {:<12} {:<20} {:<20} {:>5}",
            req.number,
            req.status,
            req.client,
            req.seller,
            req.items.len()
        );
    }
}

fn print_requisition(req: &Requisition) {
    println!("requisition {} [{}]", req.number, req.status);
    println!("  client: {}", req.client);
    println!("  seller: {}", req.seller);
    println!("  created: {}", req.created_at.to_rfc3339());
    if let Some(buyer) = &req.buyer_in_charge {
        println!("  buyer in charge: {}", buyer);
    }
    if let Some(reason) = &req.refusal_reason {
        println!("  refusal reason: {}", reason);
    }
    if !req.seller_notes.is_empty() {
        println!("  notes: {}", req.seller_notes);
    }
    if req.items_corrupt {
        println!("  WARNING: stored line items could not be read");
    }
    for item in &req.items {
        let quote = match (item.unit_price, item.line_total) {
            (Some(price), Some(total)) => format!("unit {:.2} total {:.2}", price, total),
            _ => "unquoted".to_string(),
        };
        println!(
            "  [{}] {} x{:.2} {} ({})",
            item.line_no, item.description, item.quantity, quote, item.delivery_term
        );
    }
}
