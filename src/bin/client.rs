//! Interactive client for the replicated vaccine-site database. Connects to
//! every replica port given on the command line, then serves a menu loop
//! until the user quits.

use lockstep::{ClientConfig, ClientContext, Message};
use std::io::{self, BufRead, Write};

const MENU: &str = "What would you like to do?\n\
    [l] list all vaccine site details;\n\
    [v] view # of available vaccines at a particular site;\n\
    [e] edit vaccine availability at a particular site;\n\
    [n] add a new vaccine site;\n\
    [q] close the connection and quit.\n";

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("Enter all port numbers on which server replicas have been initialized, in order for the system to work correctly!");
    println!("Example Usage (3 server replicas): client 8892 8893 8894");

    let mut args = pico_args::Arguments::from_env();
    let mut ports: Vec<u16> = Vec::new();
    while let Ok(Some(port)) = args.opt_free_from_str() {
        ports.push(port);
    }
    if !args.finish().is_empty() {
        println!("Ports must be nonnegative integers.");
        std::process::exit(1);
    }
    if ports.is_empty() {
        println!("Must enter at least one server replica.");
        std::process::exit(1);
    }

    let addrs: Vec<(&str, u16)> = ports.iter().map(|port| ("localhost", *port)).collect();
    let client = match ClientContext::connect(&addrs, ClientConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Unable to connect: {e}");
            std::process::exit(1);
        }
    };
    println!("Connected to {} servers; application starting.\n", ports.len());

    let stdin = io::stdin();
    loop {
        let msg = match prompt_choice(&stdin) {
            'l' => Message::list(),
            'v' => Message::view(prompt_site(&stdin)),
            'e' => {
                let site = prompt_site(&stdin);
                let vaccine_no = prompt_availability(&stdin);
                Message::edit(site, vaccine_no)
            }
            'n' => {
                let site = prompt_site(&stdin);
                let zip = prompt_zip(&stdin);
                Message::new_site(site, zip)
            }
            _ => {
                println!("Exiting client...");
                client.quit();
                return;
            }
        };

        match client.request(msg) {
            Some(output) => println!("\n{output}\n"),
            None => println!("\nNo server replicas remain; the request went unanswered.\n"),
        }
    }
}

fn read_line(stdin: &io::Stdin) -> String {
    let mut line = String::new();
    if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
        // End of input behaves like quitting.
        return "q".to_owned();
    }
    line.trim().to_owned()
}

fn prompt(stdin: &io::Stdin, text: &str) -> String {
    print!("{text}");
    let _ = io::stdout().flush();
    read_line(stdin)
}

fn prompt_choice(stdin: &io::Stdin) -> char {
    loop {
        let choice = prompt(stdin, MENU);
        if let "l" | "v" | "e" | "n" | "q" = choice.as_str() {
            return choice.chars().next().unwrap_or('q');
        }
    }
}

fn prompt_site(stdin: &io::Stdin) -> String {
    let mut site = prompt(stdin, "Please enter the vaccine site name: ");
    // Backtick is the wire token separator and cannot appear in a field.
    while site.contains('`') {
        site = prompt(stdin, "Site names cannot contain the ` character: ");
    }
    site
}

fn prompt_availability(stdin: &io::Stdin) -> String {
    let mut vaccine_no = prompt(
        stdin,
        "Please enter the number of available vaccines at this site (or [True/False] for binary availability): ",
    );
    loop {
        let numeric = !vaccine_no.is_empty() && vaccine_no.chars().all(|c| c.is_ascii_digit());
        if numeric || vaccine_no == "True" || vaccine_no == "False" {
            return vaccine_no;
        }
        vaccine_no = prompt(
            stdin,
            "Availability must be a nonnegative integer or [True/False]: ",
        );
    }
}

fn prompt_zip(stdin: &io::Stdin) -> String {
    let mut zip = prompt(stdin, "Please enter the ZIP code of the site: ");
    while zip.is_empty() || !zip.chars().all(|c| c.is_ascii_digit()) {
        zip = prompt(stdin, "ZIP code must be a nonnegative integer: ");
    }
    zip
}
